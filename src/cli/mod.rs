//! CLI module for the converge tool.
//!
//! This module provides the command-line interface for inspecting
//! configuration, plans and persisted state.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::{MessageLevel, OutputFormatter};
