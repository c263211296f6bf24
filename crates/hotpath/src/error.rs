use crate::unit::UnitError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed code unit: {0}")]
    Unit(#[from] UnitError),

    #[error("Failed to instrument {unit}: {reason}")]
    Instrumentation { unit: String, reason: String },

    #[error("Verification failed for {unit}.{method}: {reason}")]
    Verification {
        unit: String,
        method: String,
        reason: String,
    },

    #[error("Unit not loaded: {0}")]
    UnitNotFound(String),

    #[error("Method not found: {unit}.{method}")]
    MethodNotFound { unit: String, method: String },

    #[error("Execution error in {unit}.{method} at pc {pc}: {reason}")]
    Execution {
        unit: String,
        method: String,
        pc: u32,
        reason: String,
    },

    #[error("Uncaught throw of {value} escaped {unit}.{method}")]
    Uncaught {
        unit: String,
        method: String,
        value: String,
    },

    #[error("Data file not found: {}", .0.display())]
    DataNotFound(PathBuf),

    #[error("Invalid report payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const DATA_NOT_FOUND: i32 = 3;
    pub const INVALID_PAYLOAD: i32 = 4;
    pub const MALFORMED_UNIT: i32 = 5;
    pub const EXECUTION_FAILED: i32 = 6;
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => exit_code::INVALID_ARGUMENTS,
            Error::DataNotFound(_) => exit_code::DATA_NOT_FOUND,
            Error::Payload(_) => exit_code::INVALID_PAYLOAD,
            Error::Unit(_) | Error::Instrumentation { .. } | Error::Verification { .. } => {
                exit_code::MALFORMED_UNIT
            }
            Error::UnitNotFound(_)
            | Error::MethodNotFound { .. }
            | Error::Execution { .. }
            | Error::Uncaught { .. } => exit_code::EXECUTION_FAILED,
            _ => exit_code::GENERAL_ERROR,
        }
    }
}
