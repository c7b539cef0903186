//! Command-line interface for janitor.
//!
//! Provides commands to serve the pipeline, run single scheduler or
//! publisher cycles, import candidates and migrate the database.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
