/// Tracing subscriber setup for relay binaries.
pub mod setup;

pub use setup::{setup_logging, LoggingError};
