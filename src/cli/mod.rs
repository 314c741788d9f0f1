//! Command-line interface for jobforge.
//!
//! Provides commands for running simulated job batches and inspecting the
//! effective configuration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
