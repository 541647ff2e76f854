//! Wire types for the engine protocol, mirroring the Ethereum Engine API
//! field shapes.

use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::{Block, BlockInfo, RawTransaction};

/// An 8-byte identifier of a payload build process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadId(pub u64);

impl Serialize for PayloadId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{:016x}", self.0))
    }
}

impl<'de> Deserialize<'de> for PayloadId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        let digits = s.strip_prefix("0x").unwrap_or(&s);
        u64::from_str_radix(digits, 16)
            .map(PayloadId)
            .map_err(serde::de::Error::custom)
    }
}

/// A block assembled by the execution client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPayload {
    /// A 32 byte hash of the parent payload
    pub parent_hash: B256,
    /// The fee recipient of the new payload
    pub fee_recipient: Address,
    /// A 32 byte state root hash
    pub state_root: B256,
    /// A 32 byte receipt root hash
    pub receipts_root: B256,
    /// The logs bloom filter
    pub logs_bloom: Bytes,
    /// A 32 byte randomness value
    pub prev_randao: B256,
    /// The block index
    #[serde(with = "crate::codec::hexnum")]
    pub block_number: u64,
    /// The block gas limit
    #[serde(with = "crate::codec::hexnum")]
    pub gas_limit: u64,
    /// Gas consumed by the block
    #[serde(with = "crate::codec::hexnum")]
    pub gas_used: u64,
    /// The block timestamp
    #[serde(with = "crate::codec::hexnum")]
    pub timestamp: u64,
    /// 0 to 32 bytes of extra data
    pub extra_data: Bytes,
    /// The block hash computed by the execution client
    pub block_hash: B256,
    /// The ordered transactions, each a raw byte list
    pub transactions: Vec<RawTransaction>,
}

impl From<&ExecutionPayload> for Block {
    /// Reshapes a payload into the sequencer's block form. The block's
    /// identity is the header hash, not the execution client's
    /// `block_hash`.
    fn from(payload: &ExecutionPayload) -> Self {
        Block {
            number: payload.block_number,
            parent_hash: payload.parent_hash,
            timestamp: payload.timestamp,
            gas_used: payload.gas_used,
            gas_limit: payload.gas_limit,
            state_root: payload.state_root,
            receipts_root: payload.receipts_root,
            logs_bloom: payload.logs_bloom.clone(),
            transactions: payload.transactions.clone(),
        }
    }
}

impl From<&Block> for ExecutionPayload {
    /// Reshapes a locally fabricated block into payload form so it can be
    /// replayed into the engine after an outage.
    fn from(block: &Block) -> Self {
        ExecutionPayload {
            parent_hash: block.parent_hash,
            fee_recipient: Address::ZERO,
            state_root: block.state_root,
            receipts_root: block.receipts_root,
            logs_bloom: block.logs_bloom.clone(),
            prev_randao: B256::ZERO,
            block_number: block.number,
            gas_limit: block.gas_limit,
            gas_used: block.gas_used,
            timestamp: block.timestamp,
            extra_data: Default::default(),
            block_hash: block.hash(),
            transactions: block.transactions.clone(),
        }
    }
}

/// Build attributes for a payload request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PayloadAttributes {
    /// Timestamp of the block to build
    #[serde(with = "crate::codec::hexnum")]
    pub timestamp: u64,
    /// Randomness source for the new payload
    pub prev_randao: B256,
    /// Suggested coinbase
    pub suggested_fee_recipient: Address,
    /// Transactions to inject, in order
    pub transactions: Vec<RawTransaction>,
    /// Build only from the injected transactions
    pub no_tx_pool: bool,
    /// Gas limit for the block
    #[serde(with = "crate::codec::hexnum")]
    pub gas_limit: u64,
    /// Optional beacon root field; unused by this chain but carried for
    /// engine compatibility
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_beacon_block_root: Option<B256>,
}

/// The three hashes the engine needs for a fork-choice update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ForkchoiceState {
    /// Hash of the head of the canonical chain
    pub head_block_hash: B256,
    /// The "safe" block hash of the canonical chain
    pub safe_block_hash: B256,
    /// Hash of the most recent finalized block
    pub finalized_block_hash: B256,
}

impl From<crate::forkchoice::HeadsSnapshot> for ForkchoiceState {
    fn from(snapshot: crate::forkchoice::HeadsSnapshot) -> Self {
        ForkchoiceState {
            head_block_hash: snapshot.unsafe_head.hash,
            safe_block_hash: snapshot.safe_head.hash,
            finalized_block_hash: snapshot.finalized_head.hash,
        }
    }
}

/// The result of a fork-choice update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkChoiceUpdate {
    /// Status of the head payload
    pub payload_status: PayloadStatus,
    /// Identifier of the started build process, if attributes were sent
    pub payload_id: Option<PayloadId>,
}

/// The engine's verdict on a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadStatus {
    /// The status of the payload
    pub status: Status,
    /// Hash of the most recent valid ancestor
    pub latest_valid_hash: Option<B256>,
    /// Details when the payload is INVALID
    #[serde(default)]
    pub validation_error: Option<String>,
}

impl PayloadStatus {
    /// A plain VALID status.
    pub fn valid() -> Self {
        PayloadStatus {
            status: Status::Valid,
            latest_valid_hash: None,
            validation_error: None,
        }
    }
}

/// Status values of the engine protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Valid payload
    Valid,
    /// Invalid payload; `validation_error` carries the reason
    Invalid,
    /// The engine is still syncing
    Syncing,
    /// Payload accepted for later validation
    Accepted,
}

/// Header info for the block a payload describes, under the sequencer's
/// hashing scheme.
pub fn payload_block_info(payload: &ExecutionPayload) -> BlockInfo {
    Block::from(payload).info()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_id_serializes_padded() {
        let id = PayloadId(0x1b4);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0x00000000000001b4\"");
        let back: PayloadId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn status_uses_screaming_snake_case() {
        let json = serde_json::to_string(&Status::Valid).unwrap();
        assert_eq!(json, "\"VALID\"");
        let syncing: Status = serde_json::from_str("\"SYNCING\"").unwrap();
        assert_eq!(syncing, Status::Syncing);
    }

    #[test]
    fn payload_converts_to_block() {
        let payload = ExecutionPayload {
            block_number: 5,
            gas_limit: 30_000_000,
            timestamp: 100,
            transactions: vec![RawTransaction(vec![0x01])],
            ..Default::default()
        };
        let block = Block::from(&payload);
        assert_eq!(block.number, 5);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(payload_block_info(&payload).number, 5);
    }
}
