//! Command-line interface for quoteflow.
//!
//! Provides the `run` and `plan` commands for quote-file batches.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
