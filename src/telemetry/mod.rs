//! Application telemetry: logging and metrics.

/// Logging setup
pub mod logging;
/// Prometheus metrics
pub mod metrics;

pub use logging::init;
