//! Error handling for the rvbench CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Run failed: {0}")]
    Run(#[from] rvbench_runtime::RunError),

    #[error("Bus error: {0}")]
    Bus(#[from] rvbench_core::BusError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration loading error: {0}")]
    Loading(#[from] figment::Error),
}

impl CliError {
    pub fn config<S: Into<String>>(reason: S) -> Self {
        CliError::Config(reason.into())
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
