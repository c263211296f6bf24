pub mod agent;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod filter;
pub mod hook;
pub mod host;
pub mod inject;
pub mod report;
pub mod unit;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{Error, Result};
pub use hook::{LineProbeTransformer, UnitTransformer};
pub use hotpath_counter::CounterStore;
