//! L1 connectivity: the JSON-RPC client, the batch submission helpers, and
//! the derivation pipeline that reconstructs the safe head.

/// The JSON-RPC client and L1 wire types
pub mod client;
/// The safe-head derivation pipeline
pub mod derivation;
/// In-memory L1 for tests
pub mod mock;

pub use client::{wait_for_inclusion, JsonRpcClient, L1Api, L1Block, L1Client, L1Receipt, L1Transaction};
pub use derivation::{DerivationEvent, DerivationPipeline};
