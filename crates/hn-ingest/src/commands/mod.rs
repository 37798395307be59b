//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function. Commands print
//! their results to stdout; diagnostics go through `tracing`.

pub mod fetch;
pub mod migrate;
pub mod reset;
pub mod stats;
