//! An in-memory L1 used by tests: mines submissions immediately, supports
//! reorgs, and can simulate transport failures.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use alloy_primitives::{keccak256, Address, B256};
use async_trait::async_trait;

use crate::{
    errors::{RpcCallError, TransportError},
    l1::client::{L1Api, L1Block, L1Receipt, L1Transaction},
    transaction::{ParsedTransaction, TypedTransaction},
};

const BLOCK_TIME: u64 = 12;

#[derive(Debug, Default)]
struct MockL1State {
    blocks: Vec<L1Block>,
    receipts: HashMap<B256, L1Receipt>,
    nonces: HashMap<Address, u64>,
    inbox: Option<Address>,
    salt: u64,
    failing: bool,
}

impl MockL1State {
    fn block_hash(&self, number: u64, parent: B256) -> B256 {
        let mut preimage = Vec::with_capacity(48);
        preimage.extend_from_slice(&number.to_be_bytes());
        preimage.extend_from_slice(parent.as_slice());
        preimage.extend_from_slice(&self.salt.to_be_bytes());
        keccak256(&preimage)
    }

    fn mine(&mut self, transactions: Vec<L1Transaction>) -> u64 {
        let parent = self.blocks.last().expect("genesis always present");
        let number = parent.number + 1;
        let hash = self.block_hash(number, parent.hash);
        let block = L1Block {
            hash,
            parent_hash: parent.hash,
            number,
            timestamp: number * BLOCK_TIME,
            transactions,
        };
        for tx in block.transactions.iter() {
            self.receipts.insert(
                tx.hash,
                L1Receipt {
                    transaction_hash: tx.hash,
                    block_hash: hash,
                    block_number: number,
                    status: 1,
                },
            );
        }
        self.blocks.push(block);
        number
    }
}

/// The mock chain handle. Cloneless; share behind an `Arc`.
#[derive(Debug)]
pub struct MockL1 {
    inner: Mutex<MockL1State>,
}

impl Default for MockL1 {
    fn default() -> Self {
        Self::new()
    }
}

impl MockL1 {
    /// A fresh chain holding only a genesis block.
    pub fn new() -> Self {
        let mut state = MockL1State::default();
        let genesis = L1Block {
            hash: state.block_hash(0, B256::ZERO),
            parent_hash: B256::ZERO,
            number: 0,
            timestamp: 0,
            transactions: vec![],
        };
        state.blocks.push(genesis);
        Self {
            inner: Mutex::new(state),
        }
    }

    /// Sets the batch-inbox recipient stamped onto mined submissions.
    pub fn set_inbox(&self, inbox: Address) {
        self.inner.lock().unwrap().inbox = Some(inbox);
    }

    /// Makes every call fail with a connection error until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().unwrap().failing = failing;
    }

    /// Mines an empty block and returns its number.
    pub fn mine_empty(&self) -> u64 {
        self.inner.lock().unwrap().mine(vec![])
    }

    /// Mines a block carrying the given calldata payloads addressed to the
    /// configured inbox.
    pub fn mine_calldata(&self, payloads: Vec<Vec<u8>>) -> u64 {
        let mut state = self.inner.lock().unwrap();
        let inbox = state.inbox;
        let txs = payloads
            .into_iter()
            .map(|input| L1Transaction {
                hash: keccak256(&input),
                to: inbox,
                input: input.into(),
            })
            .collect();
        state.mine(txs)
    }

    /// Discards every block above `height` and perturbs the hash salt so
    /// re-mined blocks differ: a reorg as L1 would present it.
    pub fn reorg_to(&self, height: u64) {
        let mut state = self.inner.lock().unwrap();
        state.blocks.retain(|b| b.number <= height);
        let dropped: Vec<B256> = state
            .receipts
            .iter()
            .filter(|(_, r)| r.block_number > height)
            .map(|(h, _)| *h)
            .collect();
        for hash in dropped {
            state.receipts.remove(&hash);
        }
        state.salt += 1;
    }

    fn check_failing(&self) -> Result<(), RpcCallError> {
        if self.inner.lock().unwrap().failing {
            Err(TransportError::ConnectionRefused.into())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl L1Api for MockL1 {
    async fn submit_raw(&self, raw: &[u8]) -> Result<B256, RpcCallError> {
        self.check_failing()?;
        let mut state = self.inner.lock().unwrap();

        // mined transactions expose the envelope's calldata as their input
        let (hash, sender, input) =
            match ParsedTransaction::parse(crate::common::RawTransaction(raw.to_vec())) {
                Ok(parsed) => {
                    let input = match &parsed.tx {
                        TypedTransaction::Execute(tx) => tx.data.to_vec(),
                        TypedTransaction::Legacy(tx) => tx.data.to_vec(),
                    };
                    (parsed.hash, Some(parsed.sender), input)
                }
                Err(_) => (keccak256(raw), None, raw.to_vec()),
            };

        if let Some(sender) = sender {
            *state.nonces.entry(sender).or_insert(0) += 1;
        }
        let inbox = state.inbox;
        state.mine(vec![L1Transaction {
            hash,
            to: inbox,
            input: input.into(),
        }]);
        Ok(hash)
    }

    async fn submit_conditional(
        &self,
        raw: &[u8],
        block_number_max: u64,
    ) -> Result<B256, RpcCallError> {
        self.check_failing()?;
        {
            let state = self.inner.lock().unwrap();
            let next = state.blocks.last().map(|b| b.number + 1).unwrap_or(0);
            if next > block_number_max {
                return Err(crate::errors::EngineError {
                    code: -32003,
                    message: "conditional ceiling exceeded".to_string(),
                }
                .into());
            }
        }
        self.submit_raw(raw).await
    }

    async fn tx_receipt(&self, hash: B256) -> Result<Option<L1Receipt>, RpcCallError> {
        self.check_failing()?;
        Ok(self.inner.lock().unwrap().receipts.get(&hash).cloned())
    }

    async fn latest_block(&self) -> Result<u64, RpcCallError> {
        self.check_failing()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .blocks
            .last()
            .map(|b| b.number)
            .unwrap_or(0))
    }

    async fn get_block(
        &self,
        number: u64,
        with_txs: bool,
    ) -> Result<Option<L1Block>, RpcCallError> {
        self.check_failing()?;
        let state = self.inner.lock().unwrap();
        Ok(state.blocks.iter().find(|b| b.number == number).map(|b| {
            let mut block = b.clone();
            if !with_txs {
                block.transactions.clear();
            }
            block
        }))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, RpcCallError> {
        self.check_failing()?;
        Ok(*self
            .inner
            .lock()
            .unwrap()
            .nonces
            .get(&address)
            .unwrap_or(&0))
    }
}
