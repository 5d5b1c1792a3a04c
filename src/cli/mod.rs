//! Command-line interface for Stratum.
//!
//! This module provides argument parsing and output formatting; the
//! commands themselves are dispatched from the binary.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
