//! Module containing common types and functions used throughout the crate.

use std::fmt::Debug;

use alloy_primitives::{keccak256, Bytes, B256};
use alloy_rlp::{RlpDecodable, RlpDecodableWrapper, RlpEncodable, RlpEncodableWrapper};
use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

/// Selected block header info
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct BlockInfo {
    /// The block hash
    pub hash: B256,
    /// The block number
    pub number: u64,
    /// The parent block hash
    pub parent_hash: B256,
    /// The block timestamp
    pub timestamp: u64,
}

/// A raw transaction
#[derive(Clone, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct RawTransaction(pub Vec<u8>);

impl RawTransaction {
    /// Hash of the raw wire bytes, which identifies the transaction.
    pub fn hash(&self) -> B256 {
        keccak256(&self.0)
    }
}

/// A sequencer-built L2 block: the header fields the batch format carries
/// plus the ordered raw transaction list.
#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable, RlpDecodable)]
pub struct Block {
    /// The block height
    pub number: u64,
    /// Hash of the parent block
    pub parent_hash: B256,
    /// The block timestamp
    pub timestamp: u64,
    /// Total gas used by the block's transactions
    pub gas_used: u64,
    /// The block gas limit
    pub gas_limit: u64,
    /// Post-state root reported by the execution client
    pub state_root: B256,
    /// Receipts trie root reported by the execution client
    pub receipts_root: B256,
    /// The logs bloom filter
    pub logs_bloom: Bytes,
    /// Ordered transactions included in the block
    pub transactions: Vec<RawTransaction>,
}

/// The header-only fields that determine a block's hash.
#[derive(RlpEncodable)]
struct BlockHeader {
    number: u64,
    parent_hash: B256,
    timestamp: u64,
    gas_used: u64,
    gas_limit: u64,
    state_root: B256,
    receipts_root: B256,
    logs_bloom: Bytes,
}

impl Block {
    /// The block hash: keccak of the stable serialization of the header
    /// fields. Transactions are committed through `receipts_root` and
    /// `state_root` by the execution client.
    pub fn hash(&self) -> B256 {
        let header = BlockHeader {
            number: self.number,
            parent_hash: self.parent_hash,
            timestamp: self.timestamp,
            gas_used: self.gas_used,
            gas_limit: self.gas_limit,
            state_root: self.state_root,
            receipts_root: self.receipts_root,
            logs_bloom: self.logs_bloom.clone(),
        };
        keccak256(alloy_rlp::encode(&header))
    }

    /// Header info for fork-choice tracking.
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            hash: self.hash(),
            number: self.number,
            parent_hash: self.parent_hash,
            timestamp: self.timestamp,
        }
    }
}

/// Structural receipt for an included transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    /// The transaction hash
    pub transaction_hash: B256,
    /// Hash of the including block
    pub block_hash: B256,
    /// Number of the including block
    pub block_number: u64,
    /// Index of the transaction within the block
    pub transaction_index: u64,
    /// Inclusion status; always 1 for blocks built by this sequencer
    pub status: u64,
}

impl Debug for RawTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl Serialize for RawTransaction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(&self.0)))
    }
}

impl<'de> Deserialize<'de> for RawTransaction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tx: String = serde::Deserialize::deserialize(deserializer)?;
        let tx = tx.strip_prefix("0x").unwrap_or(&tx);
        Ok(RawTransaction(hex::decode(tx).map_err(D::Error::custom)?))
    }
}
