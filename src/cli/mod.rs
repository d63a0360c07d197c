//! Command-line interface for jobforge.
//!
//! Provides the worker daemon entrypoint plus operator commands for health
//! and metrics inspection.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
