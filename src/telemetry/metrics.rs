//! Prometheus Metrics Module.

use eyre::Result;
use lazy_static::lazy_static;
use prometheus_exporter::{
    prometheus::{
        register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
        IntCounterVec, IntGauge,
    },
    start,
};

lazy_static! {
    /// Tracks the block number of the most recent unsafe head.
    pub static ref UNSAFE_HEAD: IntGauge =
        register_int_gauge!("unsafe_head", "unsafe head number").unwrap();
    /// Tracks the block number considered to be the safe head.
    pub static ref SAFE_HEAD: IntGauge =
        register_int_gauge!("safe_head", "safe head number").unwrap();
    /// Tracks the block number of the most recent finalized head.
    pub static ref FINALIZED_HEAD: IntGauge =
        register_int_gauge!("finalized_head", "finalized head number").unwrap();
    /// Live entries in the mempool.
    pub static ref MEMPOOL_SIZE: IntGauge =
        register_int_gauge!("mempool_size", "live mempool entries").unwrap();
    /// Blocks installed as the unsafe head since boot.
    pub static ref BLOCKS_BUILT: IntCounter =
        register_int_counter!("blocks_built", "blocks built").unwrap();
    /// Batches accepted by L1 since boot.
    pub static ref BATCHES_SUBMITTED: IntCounter =
        register_int_counter!("batches_submitted", "batches submitted to l1").unwrap();
    /// Admission failures by error kind.
    pub static ref ADMISSION_ERRORS: IntCounterVec = register_int_counter_vec!(
        "admission_errors",
        "admission failures by kind",
        &["kind"]
    )
    .unwrap();
}

/// Starts the metrics server on the given port.
pub fn init(port: u16) -> Result<()> {
    let addr: std::net::SocketAddr = format!("0.0.0.0:{port}").parse()?;
    start(addr).map(|_| ()).map_err(|e| eyre::eyre!(e))
}
