//! Error kinds shared across the sequencer core.
//!
//! Validation errors are recovered at the admission boundary, transport
//! errors inside the worker loops, and fatal errors never.

use thiserror::Error;

/// Reasons a transaction is refused admission. No state changes when one of
/// these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Sender recovery failed or the signature values are out of range.
    #[error("invalid signature")]
    InvalidSignature,
    /// The transaction nonce is below the sender's current account nonce.
    #[error("invalid nonce: tx has {tx_nonce}, account is at {account_nonce}")]
    InvalidNonce {
        /// Nonce carried by the transaction.
        tx_nonce: u64,
        /// Current account nonce reported by the state source.
        account_nonce: u64,
    },
    /// The sender cannot cover `value + gas_price * gas_limit`.
    #[error("insufficient balance")]
    InsufficientBalance,
    /// Zero gas price transactions are never admitted.
    #[error("invalid gas price")]
    InvalidGasPrice,
    /// Structural RLP or envelope error while decoding the raw bytes.
    #[error("invalid rlp: {0}")]
    InvalidRlp(String),
    /// A transaction with the same hash is already in the pool.
    #[error("duplicate transaction hash")]
    DuplicateHash,
    /// Neither the state oracle nor the local cache could answer.
    #[error("no state source available")]
    StateUnavailable,
}

/// Mempool capacity errors. Transient from the caller's perspective.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MempoolError {
    /// The pool is at `max_size` live entries.
    #[error("mempool is full")]
    Full,
    /// The write-ahead log append failed; the insert did not commit.
    #[error("wal append failed: {0}")]
    Wal(String),
}

/// Network-level failures talking to the engine or L1 peers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request deadline elapsed.
    #[error("request timed out")]
    Timeout,
    /// The peer refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// The peer answered with a non-success HTTP status.
    #[error("http status {0}")]
    HttpStatus(u16),
    /// The peer answered 200 with no result and no error object.
    #[error("empty response")]
    EmptyResponse,
}

/// A JSON-RPC error object returned by a peer. Always logged with the full
/// payload before being propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine error {code}: {message}")]
pub struct EngineError {
    /// The JSON-RPC error code.
    pub code: i64,
    /// The peer supplied message.
    pub message: String,
}

/// Failure of either transport or protocol when calling a JSON-RPC peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcCallError {
    /// The request never produced a well-formed response.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The peer returned a JSON-RPC error object.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl RpcCallError {
    /// True when retrying on a later tick could reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcCallError::Transport(_))
    }
}

/// Unrecoverable conditions. The process logs a diagnostic and exits
/// non-zero when one of these surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    /// An L1 reorg reached below the finalized head.
    #[error("finalized head rewind at height {0}")]
    FinalizedRewind(u64),
    /// The write-ahead log is corrupt before its tail record.
    #[error("wal corruption: {0}")]
    WalCorruption(String),
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

/// Admission outcome surfaced to the RPC front end.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The transaction failed validation; nothing was mutated.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The pool or its WAL refused the insert.
    #[error(transparent)]
    Mempool(#[from] MempoolError),
    /// Admission is rate limited.
    #[error("rate limited")]
    RateLimited,
    /// The operator set the emergency halt flag.
    #[error("admission halted")]
    Halted,
}
