//! The tick-driven sequencing loop and the batch-submission worker.
//!
//! Each tick: apply derivation progress, request a payload built from the
//! mempool selection, install it as the unsafe head, prune included
//! transactions, and feed the batch builder. Transient engine failures
//! degrade the tick to a locally fabricated empty block so time-based
//! behavior keeps progressing.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, Bytes, B256};
use tokio::sync::{mpsc, watch};

use crate::{
    batcher::{execute_tx::ExecuteTxBuilder, Batch, BatchBuilder, SubmittedBatch},
    codec::Witness,
    common::{Block, BlockInfo, Receipt},
    engine::{Engine, PayloadAttributes, Status},
    errors::FatalError,
    forkchoice::SharedBlockState,
    l1::{client::L1Api, wait_for_inclusion, DerivationEvent},
    mempool::{Mempool, SelectionParams},
    node::ReceiptStore,
    oracle::AccountCache,
    telemetry::metrics,
    transaction::ParsedTransaction,
};

/// Attempts the readiness gate makes before degrading to empty blocks.
const ENGINE_READY_ATTEMPTS: u32 = 5;

/// Operator knobs for the loop.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Time between ticks
    pub tick_interval: Duration,
    /// Gas budget per block
    pub block_gas_limit: u64,
    /// Count cap per block
    pub max_txs_per_block: usize,
    /// Suggested coinbase for built payloads
    pub fee_recipient: Address,
}

/// The sequencing-loop worker. Single-threaded owner of fork-choice
/// updates.
pub struct SequencingDriver<E> {
    engine: Arc<E>,
    mempool: Arc<Mempool>,
    accounts: Arc<AccountCache>,
    state: SharedBlockState,
    batcher: BatchBuilder,
    derivation_rx: mpsc::Receiver<DerivationEvent>,
    batch_tx: mpsc::Sender<Batch>,
    receipts: Arc<ReceiptStore>,
    config: SequencerConfig,
    shutdown_recv: watch::Receiver<bool>,
    /// State root of the current unsafe head block.
    last_state_root: B256,
    /// Blocks fabricated while the engine was unreachable, pending replay.
    pending_sync: Vec<Block>,
}

/// Locally fabricated blocks held for engine replay after an outage.
const PENDING_SYNC_LIMIT: usize = 1024;

impl<E: Engine> SequencingDriver<E> {
    /// Wires a driver; `derivation_rx` feeds L1 progress and `batch_tx`
    /// hands flushed batches to the submitter.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<E>,
        mempool: Arc<Mempool>,
        accounts: Arc<AccountCache>,
        state: SharedBlockState,
        batcher: BatchBuilder,
        derivation_rx: mpsc::Receiver<DerivationEvent>,
        batch_tx: mpsc::Sender<Batch>,
        receipts: Arc<ReceiptStore>,
        config: SequencerConfig,
        shutdown_recv: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            mempool,
            accounts,
            state,
            batcher,
            derivation_rx,
            batch_tx,
            receipts,
            config,
            shutdown_recv,
            last_state_root: B256::ZERO,
            pending_sync: Vec::new(),
        }
    }

    /// Runs ticks until shutdown; returns only on a fatal condition.
    pub async fn start(mut self) -> Result<(), FatalError> {
        self.await_engine_ready().await;
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let ticked = tokio::select! {
                _ = interval.tick() => true,
                _ = self.shutdown_recv.changed() => false,
            };
            if *self.shutdown_recv.borrow() {
                tracing::info!("sequencing loop stopped");
                return Ok(());
            }
            if ticked {
                self.tick().await?;
            }
        }
    }

    /// Polls the engine until it answers a fork-choice probe, bounded so a
    /// dead engine degrades to empty-block mode instead of stalling the
    /// chain.
    async fn await_engine_ready(&self) {
        for attempt in 0..ENGINE_READY_ATTEMPTS {
            if *self.shutdown_recv.borrow() {
                return;
            }
            let forkchoice = self.state.snapshot().into();
            if self.engine.forkchoice_updated(forkchoice, None).await.is_ok() {
                tracing::info!("engine ready");
                return;
            }
            tracing::debug!(attempt, "engine not ready");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tracing::warn!("engine unreachable, sequencing in degraded mode");
    }

    /// One tick of the loop. Partial progress is allowed: derivation
    /// updates survive a failed payload request.
    pub async fn tick(&mut self) -> Result<(), FatalError> {
        self.apply_derivation_events()?;

        let snapshot = self.state.snapshot();
        let parent = snapshot.unsafe_head;
        let timestamp = crate::batcher::unix_now().max(parent.timestamp + 1);
        let next_number = parent.number + 1;

        if !self.resync_engine().await {
            // still degraded: extend the chain locally
            let block = self.empty_block(parent, timestamp);
            self.pending_sync.push(block.clone());
            self.cap_pending_sync();
            self.install_block(block);
            return Ok(());
        }

        let senders = self.mempool.senders();
        let selected = self.mempool.select(&SelectionParams {
            gas_budget: self.config.block_gas_limit,
            max_count: self.config.max_txs_per_block,
            block_number: next_number,
            timestamp,
            base_nonces: self.accounts.nonce_snapshot(senders.iter()),
        });

        let attrs = PayloadAttributes {
            timestamp,
            prev_randao: parent.hash,
            suggested_fee_recipient: self.config.fee_recipient,
            transactions: selected.iter().map(|tx| tx.raw.clone()).collect(),
            no_tx_pool: true,
            gas_limit: self.config.block_gas_limit,
            parent_beacon_block_root: None,
        };

        let block = match self.request_payload(attrs).await {
            Ok(block) => block,
            Err(err) if err.is_transient() => {
                tracing::warn!(%err, "engine unreachable, fabricating empty block");
                let block = self.empty_block(parent, timestamp);
                self.pending_sync.push(block.clone());
                self.cap_pending_sync();
                block
            }
            Err(err) => {
                tracing::warn!(%err, "engine rejected the payload request, retrying next tick");
                return Ok(());
            }
        };

        self.install_block(block);
        Ok(())
    }

    /// Replays blocks fabricated during an outage into the engine. Returns
    /// false while the engine is still unreachable.
    async fn resync_engine(&mut self) -> bool {
        if self.pending_sync.is_empty() {
            return true;
        }
        for block in &self.pending_sync {
            match self.engine.new_payload(block.into()).await {
                Ok(_) => {}
                Err(err) if err.is_transient() => return false,
                Err(err) => {
                    tracing::warn!(%err, "engine refused a fabricated block during resync");
                    break;
                }
            }
        }
        tracing::info!(blocks = self.pending_sync.len(), "engine resynced");
        self.pending_sync.clear();
        true
    }

    fn cap_pending_sync(&mut self) {
        if self.pending_sync.len() > PENDING_SYNC_LIMIT {
            tracing::warn!(
                limit = PENDING_SYNC_LIMIT,
                "engine outage backlog overflow, engine must resync from l1"
            );
            self.pending_sync.clear();
        }
    }

    fn apply_derivation_events(&mut self) -> Result<(), FatalError> {
        while let Ok(event) = self.derivation_rx.try_recv() {
            match event {
                DerivationEvent::SafeAdvanced { safe, l1_block } => {
                    tracing::info!(number = safe.number, l1_block, "safe head advanced");
                    self.state.update(|s| {
                        if safe.number >= s.snapshot().safe_head.number {
                            s.set_safe(safe);
                        }
                    });
                    metrics::SAFE_HEAD.set(safe.number as i64);
                }
                DerivationEvent::Finalized { finalized } => {
                    tracing::info!(number = finalized.number, "finalized head advanced");
                    self.state.update(|s| s.set_finalized(finalized))?;
                    metrics::FINALIZED_HEAD.set(finalized.number as i64);
                }
                DerivationEvent::Reorged { safe } => {
                    tracing::warn!(number = safe.number, "safe head rewound by l1 reorg");
                    self.state.update(|s| s.reorg_safe(safe))?;
                    metrics::SAFE_HEAD.set(safe.number as i64);
                }
                DerivationEvent::Fatal(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// fcu(attrs) → getPayload → newPayload, returning the block form.
    async fn request_payload(
        &self,
        attrs: PayloadAttributes,
    ) -> Result<Block, crate::errors::RpcCallError> {
        let forkchoice = self.state.snapshot().into();
        let update = self.engine.forkchoice_updated(forkchoice, Some(attrs)).await?;
        if update.payload_status.status != Status::Valid {
            return Err(crate::errors::EngineError {
                code: -38003,
                message: format!(
                    "payload attributes refused: {:?}",
                    update.payload_status.validation_error
                ),
            }
            .into());
        }
        let id = update.payload_id.ok_or(crate::errors::EngineError {
            code: -38003,
            message: "engine did not return a payload id".to_string(),
        })?;

        let payload = self.engine.get_payload(id).await?;
        let status = self.engine.new_payload(payload.clone()).await?;
        if status.status != Status::Valid && status.status != Status::Accepted {
            return Err(crate::errors::EngineError {
                code: -32002,
                message: format!("payload import refused: {:?}", status.validation_error),
            }
            .into());
        }

        Ok(Block::from(&payload))
    }

    /// A block with no transactions extending the current head locally.
    /// State is unchanged, so it carries the parent's state root.
    fn empty_block(&self, parent: BlockInfo, timestamp: u64) -> Block {
        Block {
            number: parent.number + 1,
            parent_hash: parent.hash,
            timestamp,
            gas_used: 0,
            gas_limit: self.config.block_gas_limit,
            state_root: self.last_state_root,
            receipts_root: B256::ZERO,
            logs_bloom: Bytes::from(vec![0u8; 256]),
            transactions: vec![],
        }
    }

    /// Installs a block as the unsafe head: advances fork-choice, removes
    /// included transactions from the pool exactly once, records receipts,
    /// and feeds the batch builder.
    fn install_block(&mut self, block: Block) {
        let info = block.info();
        let parent_state_root = self.last_state_root;

        let head = self.state.snapshot().unsafe_head;
        if info.number < head.number {
            // an engine that has not caught up with a reorg rewind can
            // answer with a payload behind the head
            tracing::warn!(
                number = info.number,
                head = head.number,
                "discarding stale payload behind the unsafe head"
            );
            return;
        }

        self.state.update(|s| s.set_unsafe(info));
        metrics::UNSAFE_HEAD.set(info.number as i64);
        metrics::BLOCKS_BUILT.inc();

        for (index, raw) in block.transactions.iter().enumerate() {
            let Ok(parsed) = ParsedTransaction::parse(raw.clone()) else {
                continue;
            };
            self.mempool.remove(&parsed.hash);
            self.accounts.bump_nonce(parsed.sender, parsed.tx.nonce() + 1);
            self.receipts.insert(Receipt {
                transaction_hash: parsed.hash,
                block_hash: info.hash,
                block_number: info.number,
                transaction_index: index as u64,
                status: 1,
            });
        }
        metrics::MEMPOOL_SIZE.set(self.mempool.len() as i64);
        self.last_state_root = block.state_root;

        tracing::info!(
            number = info.number,
            txs = block.transactions.len(),
            "unsafe head updated"
        );

        if !block.transactions.is_empty() {
            self.batcher.push(block, parent_state_root);
        }

        if self.batcher.is_flushable() {
            if let Some(batch) = self.batcher.flush() {
                tracing::info!(blocks = batch.blocks.len(), "batch flushed");
                if let Err(err) = self.batch_tx.try_send(batch) {
                    tracing::warn!(%err, "batch submitter backlogged, batch dropped");
                }
            }
        }
    }
}

impl<E> std::fmt::Debug for SequencingDriver<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencingDriver")
            .field("pending_sync", &self.pending_sync.len())
            .finish()
    }
}

/// The batch-submission worker: builds an ExecuteTx for every flushed
/// batch, submits it, and waits for inclusion.
pub struct BatchSubmitter<L> {
    l1: Arc<L>,
    builder: Option<ExecuteTxBuilder>,
    batch_rx: mpsc::Receiver<Batch>,
    confirmations: u64,
}

impl<L: L1Api> BatchSubmitter<L> {
    /// A submitter signing with `builder`; `None` disables L1 submission.
    pub fn new(
        l1: Arc<L>,
        builder: Option<ExecuteTxBuilder>,
        batch_rx: mpsc::Receiver<Batch>,
        confirmations: u64,
    ) -> Self {
        Self {
            l1,
            builder,
            batch_rx,
            confirmations,
        }
    }

    /// Drains flushed batches until the sending side closes.
    pub async fn run(mut self) {
        while let Some(batch) = self.batch_rx.recv().await {
            let Some(builder) = self.builder.clone() else {
                tracing::warn!(
                    blocks = batch.blocks.len(),
                    "no sequencer key configured, dropping flushed batch"
                );
                continue;
            };
            match self.submit(&builder, batch).await {
                Ok(submitted) => {
                    metrics::BATCHES_SUBMITTED.inc();
                    tracing::info!(
                        l1_tx = %submitted.l1_tx_hash,
                        l1_block = submitted.l1_block,
                        blocks = submitted.batch.blocks.len(),
                        "batch included on l1"
                    );
                }
                Err(err) => {
                    tracing::warn!(%err, "batch submission failed, deferring");
                }
            }
        }
    }

    /// Builds, submits with bounded retry, and waits for inclusion.
    pub async fn submit(
        &self,
        builder: &ExecuteTxBuilder,
        batch: Batch,
    ) -> eyre::Result<SubmittedBatch> {
        let built = builder.build(self.l1.as_ref(), &batch, &Witness::default()).await?;

        let policy = again::RetryPolicy::exponential(Duration::from_millis(250))
            .with_max_retries(3)
            .with_jitter(true);
        let l1 = self.l1.clone();
        let raw = built.raw.clone();
        let hash = policy
            .retry(move || {
                let l1 = l1.clone();
                let raw = raw.clone();
                async move { l1.submit_raw(&raw).await }
            })
            .await?;

        let receipt = wait_for_inclusion(
            self.l1.as_ref(),
            hash,
            self.confirmations,
            Duration::from_millis(500),
            Duration::from_secs(120),
        )
        .await?;

        Ok(SubmittedBatch {
            batch,
            l1_tx_hash: hash,
            l1_block: receipt.block_number,
        })
    }
}

impl<L> std::fmt::Debug for BatchSubmitter<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSubmitter")
            .field("confirmations", &self.confirmations)
            .finish()
    }
}
