//! CLI module for Terrace.
//!
//! This module provides the command-line interface for planning and
//! applying declared infrastructure.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
