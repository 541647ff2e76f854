//! Logging setup.
//!
//! A compact `fmt` subscriber behind an `EnvFilter`. `RUST_LOG` overrides
//! the verbosity flag; `log` records from dependencies are bridged in by
//! the subscriber itself.

use eyre::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. Errors if one is already registered.
pub fn init(verbose: bool) -> Result<()> {
    let default_directive = if verbose { "tempo=debug" } else { "tempo=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init()
        .map_err(|e| eyre::eyre!("failed to install tracing subscriber: {e}"))
}
