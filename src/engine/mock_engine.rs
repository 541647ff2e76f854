//! An in-process engine that builds payloads directly from the attributes
//! it is given. Used by tests and by nothing else.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use alloy_primitives::{keccak256, B256};
use async_trait::async_trait;

use crate::{
    common::{Block, BlockInfo},
    errors::{EngineError, RpcCallError, TransportError},
};

use super::{
    Engine, ExecutionPayload, ForkChoiceUpdate, ForkchoiceState, PayloadAttributes, PayloadId,
    PayloadStatus,
};

const GAS_PER_TX: u64 = 21_000;

#[derive(Debug)]
struct PendingBuild {
    id: PayloadId,
    parent_hash: B256,
    parent_number: u64,
    attrs: PayloadAttributes,
}

#[derive(Debug, Default)]
struct MockState {
    /// block hash -> number, under the sequencer's hashing scheme
    numbers: HashMap<B256, u64>,
    pending: Option<PendingBuild>,
    next_payload_id: u64,
}

/// Mock engine that assembles payloads from submitted attributes.
#[derive(Debug)]
pub struct MockEngine {
    inner: Mutex<MockState>,
    failing: AtomicBool,
}

impl MockEngine {
    /// An engine aware of the given genesis reference.
    pub fn new(genesis: BlockInfo) -> Self {
        let mut state = MockState::default();
        state.numbers.insert(genesis.hash, genesis.number);
        Self {
            inner: Mutex::new(state),
            failing: AtomicBool::new(false),
        }
    }

    /// Makes every call fail with a connection error until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_failing(&self) -> Result<(), RpcCallError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(TransportError::ConnectionRefused.into())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn forkchoice_updated(
        &self,
        forkchoice_state: ForkchoiceState,
        payload_attributes: Option<PayloadAttributes>,
    ) -> Result<ForkChoiceUpdate, RpcCallError> {
        self.check_failing()?;
        let mut state = self.inner.lock().unwrap();

        let payload_id = match payload_attributes {
            Some(attrs) => {
                let parent_hash = forkchoice_state.head_block_hash;
                let parent_number = state.numbers.get(&parent_hash).copied().unwrap_or(0);
                state.next_payload_id += 1;
                let id = PayloadId(state.next_payload_id);
                state.pending = Some(PendingBuild {
                    id,
                    parent_hash,
                    parent_number,
                    attrs,
                });
                Some(id)
            }
            None => None,
        };

        Ok(ForkChoiceUpdate {
            payload_status: PayloadStatus::valid(),
            payload_id,
        })
    }

    async fn get_payload(&self, payload_id: PayloadId) -> Result<ExecutionPayload, RpcCallError> {
        self.check_failing()?;
        let mut state = self.inner.lock().unwrap();
        let pending = state.pending.take().ok_or(EngineError {
            code: -38001,
            message: "unknown payload".to_string(),
        })?;
        if pending.id != payload_id {
            return Err(EngineError {
                code: -38001,
                message: "unknown payload".to_string(),
            }
            .into());
        }

        let number = pending.parent_number + 1;
        let mut root_preimage = pending.parent_hash.to_vec();
        root_preimage.extend_from_slice(&number.to_be_bytes());

        let payload = ExecutionPayload {
            parent_hash: pending.parent_hash,
            fee_recipient: pending.attrs.suggested_fee_recipient,
            state_root: keccak256(&root_preimage),
            receipts_root: keccak256([root_preimage.as_slice(), b"receipts"].concat()),
            logs_bloom: vec![0u8; 256].into(),
            prev_randao: pending.attrs.prev_randao,
            block_number: number,
            gas_limit: pending.attrs.gas_limit,
            gas_used: pending.attrs.transactions.len() as u64 * GAS_PER_TX,
            timestamp: pending.attrs.timestamp,
            extra_data: Default::default(),
            block_hash: B256::ZERO,
            transactions: pending.attrs.transactions.clone(),
        };

        let info = Block::from(&payload).info();
        state.numbers.insert(info.hash, info.number);

        Ok(payload)
    }

    async fn new_payload(&self, payload: ExecutionPayload) -> Result<PayloadStatus, RpcCallError> {
        self.check_failing()?;
        let mut state = self.inner.lock().unwrap();
        let info = Block::from(&payload).info();
        state.numbers.insert(info.hash, info.number);
        Ok(PayloadStatus::valid())
    }
}
