//! Observability module providing structured logging.
//!
//! Logs are emitted with `tracing` throughout the crate; this module installs
//! the subscriber with the configured format (pretty, compact, JSON).

mod tracing_init;

pub use tracing_init::*;
