pub mod inspect;
pub mod instrument;
pub mod regenerate;
pub mod run;
