//! Assembles a flushed batch into a signed type 0x05 envelope ready for L1
//! submission.

use alloy_primitives::{Address, Bytes, B256, U256};
use eyre::Result;
use secp256k1::SecretKey;

use crate::{
    batcher::Batch,
    codec::Witness,
    l1::client::L1Api,
    transaction::{address_of, ExecuteTransaction},
};

/// A signed envelope and the identifiers the submitter tracks it by.
#[derive(Debug, Clone)]
pub struct BuiltExecuteTx {
    /// Raw wire bytes for `eth_sendRawTransaction`.
    pub raw: Vec<u8>,
    /// The envelope's identity digest.
    pub hash: B256,
    /// The assembled transaction.
    pub tx: ExecuteTransaction,
}

/// Builds ExecuteTx envelopes from flushed batches using the sequencer's
/// signing key and the configured fee policy.
#[derive(Debug, Clone)]
pub struct ExecuteTxBuilder {
    key: SecretKey,
    sender: Address,
    /// Target L1 chain id
    pub chain_id: u64,
    /// Stateless-execution precompile, or None for inbox-less submission
    pub to: Option<Address>,
    /// Fee cap applied to every envelope
    pub max_fee_per_gas: U256,
    /// Tip cap applied to every envelope
    pub max_priority_fee_per_gas: U256,
    /// Gas ceiling for the envelope
    pub gas_limit: u64,
    /// Coinbase stamped into the block context
    pub coinbase: Address,
}

impl ExecuteTxBuilder {
    /// Creates a builder signing with `key`.
    pub fn new(
        key: SecretKey,
        chain_id: u64,
        to: Option<Address>,
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
        gas_limit: u64,
        coinbase: Address,
    ) -> Self {
        let sender = address_of(&key);
        Self {
            key,
            sender,
            chain_id,
            to,
            max_fee_per_gas,
            max_priority_fee_per_gas,
            gas_limit,
            coinbase,
        }
    }

    /// The L1 account the envelopes spend from.
    pub fn sender(&self) -> Address {
        self.sender
    }

    /// Assembles and signs an envelope for `batch`. The witness is supplied
    /// by the caller; an empty witness is a valid degenerate case. The L1
    /// account nonce is read per build.
    pub async fn build<L: L1Api>(
        &self,
        l1: &L,
        batch: &Batch,
        witness: &Witness,
    ) -> Result<BuiltExecuteTx> {
        let first = batch
            .blocks
            .first()
            .ok_or_else(|| eyre::eyre!("refusing to build an envelope for an empty batch"))?;

        // a zero commitment is only meaningful for a chain's very first block
        if batch.pre_state_root == B256::ZERO && first.number > 1 {
            eyre::bail!(
                "batch at block {} carries a zero pre-state commitment",
                first.number
            );
        }

        let nonce = l1.transaction_count(self.sender).await?;
        let witness_bytes = witness.encoded();

        let tx = ExecuteTransaction {
            chain_id: self.chain_id,
            nonce,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
            max_fee_per_gas: self.max_fee_per_gas,
            gas_limit: self.gas_limit,
            to: self.to,
            value: U256::ZERO,
            data: Bytes::from(batch.encode()),
            pre_state_root: batch.pre_state_root,
            witness_size: witness_bytes.len() as u64,
            witness: Bytes::from(witness_bytes),
            withdrawals_size: 0,
            coinbase: self.coinbase,
            block_number: first.number,
            timestamp: first.timestamp,
            blob_hashes: vec![],
            signature: Default::default(),
        }
        .sign(&self.key);

        Ok(BuiltExecuteTx {
            raw: tx.encoded(),
            hash: tx.signing_digest(),
            tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::Block,
        l1::mock::MockL1,
        transaction::{ParsedTransaction, TypedTransaction},
    };

    fn builder() -> ExecuteTxBuilder {
        let key = SecretKey::from_slice(&[0x42; 32]).unwrap();
        ExecuteTxBuilder::new(
            key,
            1,
            None,
            U256::from(100u64),
            U256::from(2u64),
            5_000_000,
            Address::repeat_byte(0x0f),
        )
    }

    fn one_block_batch(number: u64, pre_state: B256) -> Batch {
        Batch {
            blocks: vec![Block {
                number,
                timestamp: number * 2,
                state_root: B256::repeat_byte(number as u8),
                ..Default::default()
            }],
            created_at: 1700000000,
            pre_state_root: pre_state,
        }
    }

    #[tokio::test]
    async fn builds_a_parseable_envelope() {
        let l1 = MockL1::new();
        let builder = builder();
        let batch = one_block_batch(5, B256::repeat_byte(0x33));

        let built = builder.build(&l1, &batch, &Witness::default()).await.unwrap();
        let parsed = ParsedTransaction::parse(crate::common::RawTransaction(built.raw)).unwrap();
        assert_eq!(parsed.sender, builder.sender());
        match parsed.tx {
            TypedTransaction::Execute(tx) => {
                assert_eq!(tx.block_number, 5);
                assert_eq!(tx.timestamp, 10);
                assert_eq!(tx.pre_state_root, B256::repeat_byte(0x33));
                assert_eq!(Batch::decode_blocks(&tx.data).unwrap(), batch.blocks);
            }
            _ => panic!("expected execute envelope"),
        }
    }

    #[tokio::test]
    async fn nonce_tracks_the_l1_account() {
        let l1 = MockL1::new();
        let builder = builder();
        let batch = one_block_batch(5, B256::repeat_byte(0x33));

        let first = builder.build(&l1, &batch, &Witness::default()).await.unwrap();
        assert_eq!(first.tx.nonce, 0);
        l1.submit_raw(&first.raw).await.unwrap();

        let second = builder.build(&l1, &batch, &Witness::default()).await.unwrap();
        assert_eq!(second.tx.nonce, 1);
    }

    #[tokio::test]
    async fn rejects_placeholder_commitment() {
        let l1 = MockL1::new();
        let builder = builder();
        let batch = one_block_batch(5, B256::ZERO);
        assert!(builder.build(&l1, &batch, &Witness::default()).await.is_err());
    }

    #[tokio::test]
    async fn rejects_empty_batch() {
        let l1 = MockL1::new();
        let builder = builder();
        let batch = Batch {
            blocks: vec![],
            created_at: 0,
            pre_state_root: B256::ZERO,
        };
        assert!(builder.build(&l1, &batch, &Witness::default()).await.is_err());
    }
}
