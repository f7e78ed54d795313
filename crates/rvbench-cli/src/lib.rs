//! rvbench CLI library
//!
//! Argument parsing, configuration loading and the command handlers behind
//! the `rvbench` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{normalize_legacy_flags, Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::AppConfig;
pub use error::{CliError, Result};
