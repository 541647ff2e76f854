//! Aggregates sequencer-built blocks into batches and turns flushed batches
//! into signed ExecuteTx envelopes for L1 submission.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use alloy_primitives::B256;
use alloy_rlp::Encodable;

use crate::{
    codec::{decode_exact, BATCH_VERSION},
    common::Block,
    errors::ValidationError,
};

pub mod execute_tx;

/// An ordered, immutable snapshot of aggregated blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// The batched blocks, in build order.
    pub blocks: Vec<Block>,
    /// Unix seconds at flush time.
    pub created_at: u64,
    /// State root the first batched block executes against.
    pub pre_state_root: B256,
}

impl Batch {
    /// The versioned calldata form: one version byte followed by the RLP
    /// list of blocks.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![BATCH_VERSION];
        self.blocks.encode(&mut out);
        out
    }

    /// Parses versioned calldata back into the contained blocks.
    pub fn decode_blocks(data: &[u8]) -> Result<Vec<Block>, ValidationError> {
        match data.first() {
            None => Err(ValidationError::InvalidRlp("empty batch data".to_string())),
            Some(&BATCH_VERSION) => decode_exact(&data[1..]),
            Some(v) => Err(ValidationError::InvalidRlp(format!(
                "unknown batch version {v:#04x}"
            ))),
        }
    }
}

/// A batch together with its L1 inclusion record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedBatch {
    /// The flushed batch.
    pub batch: Batch,
    /// Hash of the carrying L1 transaction.
    pub l1_tx_hash: B256,
    /// Number of the including L1 block.
    pub l1_block: u64,
}

/// Accumulates non-empty blocks until a flush condition is reached: block
/// count, serialized size, or age of the oldest pending block.
#[derive(Debug)]
pub struct BatchBuilder {
    size_limit: usize,
    byte_limit: usize,
    max_age: Duration,
    blocks: Vec<Block>,
    pending_bytes: usize,
    opened_at: Option<Instant>,
    pre_state_root: B256,
}

impl BatchBuilder {
    /// A builder flushing at `size_limit` blocks, `byte_limit` serialized
    /// bytes, or `max_age` since the first pending block.
    pub fn new(size_limit: usize, byte_limit: usize, max_age: Duration) -> Self {
        Self {
            size_limit,
            byte_limit,
            max_age,
            blocks: Vec::new(),
            pending_bytes: 0,
            opened_at: None,
            pre_state_root: B256::ZERO,
        }
    }

    /// Appends a block. `parent_state_root` is the state root the block
    /// executed against; the first pushed block's value becomes the batch's
    /// pre-state commitment.
    pub fn push(&mut self, block: Block, parent_state_root: B256) {
        if self.blocks.is_empty() {
            self.opened_at = Some(Instant::now());
            self.pre_state_root = parent_state_root;
        }
        self.pending_bytes += block.length();
        self.blocks.push(block);
    }

    /// Number of pending blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True when no blocks are pending.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// True when any flush condition holds.
    pub fn is_flushable(&self) -> bool {
        if self.blocks.is_empty() {
            return false;
        }
        self.blocks.len() >= self.size_limit
            || self.pending_bytes >= self.byte_limit
            || self
                .opened_at
                .map_or(false, |opened| opened.elapsed() >= self.max_age)
    }

    /// Takes the pending blocks as an immutable batch and resets the
    /// builder. Returns `None` when nothing is pending.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.blocks.is_empty() {
            return None;
        }
        let blocks = std::mem::take(&mut self.blocks);
        let pre_state_root = self.pre_state_root;
        self.pending_bytes = 0;
        self.opened_at = None;
        self.pre_state_root = B256::ZERO;
        Some(Batch {
            blocks,
            created_at: unix_now(),
            pre_state_root,
        })
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RawTransaction;

    fn block(number: u64) -> Block {
        Block {
            number,
            state_root: B256::repeat_byte(number as u8),
            transactions: vec![RawTransaction(vec![number as u8; 4])],
            ..Default::default()
        }
    }

    #[test]
    fn flushes_at_block_count() {
        let mut builder = BatchBuilder::new(3, usize::MAX, Duration::from_secs(3600));
        builder.push(block(1), B256::repeat_byte(0x10));
        builder.push(block(2), B256::ZERO);
        assert!(!builder.is_flushable());
        builder.push(block(3), B256::ZERO);
        assert!(builder.is_flushable());

        let batch = builder.flush().unwrap();
        assert_eq!(batch.blocks.len(), 3);
        assert_eq!(batch.pre_state_root, B256::repeat_byte(0x10));
        assert!(builder.is_empty());
        assert!(builder.flush().is_none());
    }

    #[test]
    fn flushes_at_byte_limit() {
        let mut builder = BatchBuilder::new(1000, 1, Duration::from_secs(3600));
        builder.push(block(1), B256::ZERO);
        assert!(builder.is_flushable());
    }

    #[test]
    fn batch_calldata_roundtrip() {
        let batch = Batch {
            blocks: vec![block(1), block(2)],
            created_at: 1700000000,
            pre_state_root: B256::repeat_byte(0x10),
        };
        let encoded = batch.encode();
        assert_eq!(encoded[0], BATCH_VERSION);
        let blocks = Batch::decode_blocks(&encoded).unwrap();
        assert_eq!(blocks, batch.blocks);
    }

    #[test]
    fn decode_rejects_unknown_version() {
        assert!(Batch::decode_blocks(&[0x07, 0xc0]).is_err());
        assert!(Batch::decode_blocks(&[]).is_err());
    }
}
