//! # Tempo
//!
//! `Tempo` is the ordering core of a Layer-2 rollup sequencer. It accepts
//! signed L2 transactions, validates them against an external state oracle,
//! holds them in a prioritized pending pool backed by a write-ahead log,
//! drives periodic block building through an execution client's engine
//! protocol, aggregates built blocks into batches, and submits those
//! batches to L1 as stateless-execution envelopes. The safe L2 head is
//! derived back out of L1, giving the sequencer a recovery path after
//! crashes and reorgs.
//!
//! ## Modules
//!
//! - [`common`]: Core chain types shared across the crate.
//! - [`codec`]: Typed-envelope framing and the witness container.
//! - [`transaction`]: Parsed transaction variants and sender recovery.
//! - [`mempool`]: The prioritized pending pool and its WAL.
//! - [`validator`]: Pre-admission checks.
//! - [`oracle`]: Read-through state queries with the fallback cache.
//! - [`engine`]: The authenticated engine protocol client.
//! - [`forkchoice`]: The unsafe/safe/finalized block-state machine.
//! - [`sequencer`]: The tick-driven sequencing loop and batch submitter.
//! - [`batcher`]: Batch aggregation and ExecuteTx assembly.
//! - [`l1`]: The L1 client and the safe-head derivation pipeline.
//! - [`rpc`]: The transaction ingress server.
//! - [`node`]: Wiring and admission.
//! - [`config`]: Configuration loading.
//! - [`telemetry`]: Logging and metrics.
//! - [`errors`]: The error taxonomy.

#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

pub mod batcher;
pub mod codec;
pub mod common;
pub mod config;
pub mod engine;
pub mod errors;
pub mod forkchoice;
pub mod l1;
pub mod mempool;
pub mod node;
pub mod oracle;
pub mod rpc;
pub mod sequencer;
pub mod telemetry;
pub mod transaction;
pub mod validator;
