//! Wires the subsystems together: admission at the front, the sequencing
//! loop in the middle, derivation and batch submission at the back.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use alloy_primitives::{B256, U256};
use eyre::Result;
use tokio::sync::{mpsc, watch};

use crate::{
    batcher::{execute_tx::ExecuteTxBuilder, BatchBuilder},
    common::{BlockInfo, RawTransaction, Receipt},
    config::Config,
    engine::{EngineApi, EngineAuth},
    errors::AdmissionError,
    forkchoice::SharedBlockState,
    l1::{DerivationPipeline, L1Client},
    mempool::{wal::FsyncPolicy, InclusionPredicate, InsertOutcome, Mempool},
    oracle::{AccountCache, CachingOracle, HttpStateOracle, StateSource},
    sequencer::{BatchSubmitter, SequencerConfig, SequencingDriver},
    telemetry::metrics,
    transaction::ParsedTransaction,
    validator::Validator,
};

/// Bounded store of structural receipts for included transactions.
#[derive(Debug)]
pub struct ReceiptStore {
    inner: RwLock<(VecDeque<B256>, HashMap<B256, Receipt>)>,
    capacity: usize,
}

impl ReceiptStore {
    /// A store retaining at most `capacity` receipts.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new((VecDeque::new(), HashMap::new())),
            capacity,
        }
    }

    /// Records a receipt, evicting the oldest past capacity.
    pub fn insert(&self, receipt: Receipt) {
        let mut inner = self.inner.write().expect("receipt store lock poisoned");
        let (order, map) = &mut *inner;
        if map.insert(receipt.transaction_hash, receipt.clone()).is_none() {
            order.push_back(receipt.transaction_hash);
        }
        while order.len() > self.capacity {
            if let Some(evicted) = order.pop_front() {
                map.remove(&evicted);
            }
        }
    }

    /// Structural receipt lookup.
    pub fn get(&self, hash: &B256) -> Option<Receipt> {
        self.inner
            .read()
            .expect("receipt store lock poisoned")
            .1
            .get(hash)
            .cloned()
    }
}

/// Per-second token bucket for admission rate limiting.
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: u64) -> Self {
        Self {
            rate: rate as f64,
            tokens: rate as f64,
            last: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// The admission front end shared by every RPC worker: rate limit, halt
/// flag, parse, validate, insert.
pub struct Admission<S> {
    mempool: Arc<Mempool>,
    validator: Validator<S>,
    limiter: Mutex<TokenBucket>,
    halted: AtomicBool,
}

impl<S: StateSource> Admission<S> {
    /// Wires an admission handle over the shared pool and state source.
    pub fn new(mempool: Arc<Mempool>, validator: Validator<S>, rate_limit: u64, halted: bool) -> Self {
        Self {
            mempool,
            validator,
            limiter: Mutex::new(TokenBucket::new(rate_limit)),
            halted: AtomicBool::new(halted),
        }
    }

    /// Flips the emergency halt flag.
    pub fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::SeqCst);
    }

    /// Admits raw transaction bytes, returning the transaction's identity
    /// hash. The WAL append inside the pool is the commit point.
    pub async fn submit(
        &self,
        raw: Vec<u8>,
        predicate: Option<InclusionPredicate>,
    ) -> Result<B256, AdmissionError> {
        let result = self.submit_inner(raw, predicate).await;
        if let Err(err) = &result {
            metrics::ADMISSION_ERRORS
                .with_label_values(&[admission_error_kind(err)])
                .inc();
        }
        result
    }

    async fn submit_inner(
        &self,
        raw: Vec<u8>,
        predicate: Option<InclusionPredicate>,
    ) -> Result<B256, AdmissionError> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(AdmissionError::Halted);
        }
        if !self.limiter.lock().expect("limiter lock poisoned").try_take() {
            return Err(AdmissionError::RateLimited);
        }

        let parsed = ParsedTransaction::parse(RawTransaction(raw))
            .map_err(AdmissionError::Validation)?;
        self.validator
            .validate(&parsed)
            .await
            .map_err(AdmissionError::Validation)?;

        let hash = parsed.hash;
        match self.mempool.insert(parsed, predicate)? {
            InsertOutcome::Inserted => {
                metrics::MEMPOOL_SIZE.set(self.mempool.len() as i64);
                Ok(hash)
            }
            InsertOutcome::DuplicateHash => Err(AdmissionError::Validation(
                crate::errors::ValidationError::DuplicateHash,
            )),
            InsertOutcome::Full => {
                Err(AdmissionError::Mempool(crate::errors::MempoolError::Full))
            }
        }
    }
}

impl<S> std::fmt::Debug for Admission<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission").finish()
    }
}

fn admission_error_kind(err: &AdmissionError) -> &'static str {
    use crate::errors::ValidationError::*;
    match err {
        AdmissionError::Validation(InvalidSignature) => "invalid_signature",
        AdmissionError::Validation(InvalidNonce { .. }) => "invalid_nonce",
        AdmissionError::Validation(InsufficientBalance) => "insufficient_balance",
        AdmissionError::Validation(InvalidGasPrice) => "invalid_gas_price",
        AdmissionError::Validation(InvalidRlp(_)) => "invalid_rlp",
        AdmissionError::Validation(DuplicateHash) => "duplicate_hash",
        AdmissionError::Validation(StateUnavailable) => "state_unavailable",
        AdmissionError::Mempool(_) => "mempool_full",
        AdmissionError::RateLimited => "rate_limited",
        AdmissionError::Halted => "halted",
    }
}

/// The assembled node. Construction wires every worker; [`Node::run`]
/// drives the sequencing loop on the current task.
pub struct Node {
    config: Config,
    shutdown_recv: watch::Receiver<bool>,
}

impl Node {
    /// Builds a node from a validated configuration and registers the
    /// SIGINT handler.
    pub fn from_config(config: Config) -> Result<Self> {
        let (shutdown_sender, shutdown_recv) = watch::channel(false);
        ctrlc::set_handler(move || {
            tracing::info!("shutting down");
            shutdown_sender
                .send(true)
                .expect("could not send shutdown signal");
        })?;
        Ok(Self {
            config,
            shutdown_recv,
        })
    }

    /// Starts every worker and runs the sequencing loop until shutdown or
    /// a fatal condition.
    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let genesis = BlockInfo::default();
        let state = SharedBlockState::new(genesis);

        // mempool: replay the WAL before anything becomes visible
        let fsync = if config.wal_fsync_interval_ms == 0 {
            FsyncPolicy::EveryRecord
        } else {
            FsyncPolicy::Interval(Duration::from_millis(config.wal_fsync_interval_ms))
        };
        let (mempool, report) = Mempool::recover(
            config.mempool_capacity,
            config.wal_path_or_default(),
            fsync,
            |tx| !tx.tx.gas_price().is_zero(),
        )?;
        let mempool = Arc::new(mempool);
        tracing::info!(replayed = report.replayed, "wal replay complete");
        metrics::MEMPOOL_SIZE.set(mempool.len() as i64);

        // state oracle + admission
        let accounts = Arc::new(AccountCache::default());
        let oracle = Arc::new(CachingOracle::new(
            HttpStateOracle::new(&config.l2_rpc_url),
            accounts.clone(),
        ));
        let validator = Validator::new(oracle);
        let admission = Arc::new(Admission::new(
            mempool.clone(),
            validator,
            config.admission_rate_limit,
            config.halted,
        ));

        // engine client
        let auth = match &config.jwt_secret {
            Some(secret) => EngineAuth::from_hex(secret)?,
            None => {
                tracing::warn!("no jwt secret configured, engine calls will fail");
                EngineAuth::ephemeral()
            }
        };
        let engine = Arc::new(EngineApi::new(&config.l2_engine_url, auth));

        // l1 side: derivation reader and batch submitter
        let l1 = Arc::new(L1Client::new(&config.l1_rpc_url));
        let (derivation_tx, derivation_rx) = mpsc::channel(256);
        let pipeline = DerivationPipeline::new(
            l1.clone(),
            config.batch_inbox,
            config.confirmation_depth,
            genesis,
            config.l1_start_block,
        );
        let derivation_handle = pipeline.spawn(derivation_tx, self.shutdown_recv.clone());

        let execute_builder = config.sequencer_secret_key().map(|key| {
            ExecuteTxBuilder::new(
                key,
                config.l1_chain_id,
                config.execute_tx_target,
                U256::from(config.max_fee_per_gas),
                U256::from(config.max_priority_fee_per_gas),
                config.execute_gas_limit,
                config.fee_recipient,
            )
        });
        if execute_builder.is_none() {
            tracing::warn!("no sequencer key configured, l1 submission disabled");
        }
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let submitter = BatchSubmitter::new(
            l1.clone(),
            execute_builder,
            batch_rx,
            config.submit_confirmations,
        );
        let submitter_handle = tokio::spawn(submitter.run());

        // front end
        let receipts = Arc::new(ReceiptStore::new(100_000));
        let rpc_addr = crate::rpc::run_server(
            &config.rpc_addr,
            config.rpc_port,
            admission,
            receipts.clone(),
            state.clone(),
        )
        .await?;
        tracing::info!(%rpc_addr, "rpc server started");

        if let Err(err) = metrics::init(config.metrics_port) {
            tracing::warn!(%err, "metrics exporter failed to start");
        }

        // the sequencing loop owns fork-choice and runs on this task
        let batcher = BatchBuilder::new(
            config.batch_size_limit,
            config.batch_byte_limit,
            Duration::from_millis(config.batch_max_age_ms),
        );
        let driver = SequencingDriver::new(
            engine,
            mempool.clone(),
            accounts,
            state,
            batcher,
            derivation_rx,
            batch_tx,
            receipts,
            SequencerConfig {
                tick_interval: Duration::from_millis(config.tick_interval_ms),
                block_gas_limit: config.block_gas_limit,
                max_txs_per_block: config.max_txs_per_block,
                fee_recipient: config.fee_recipient,
            },
            self.shutdown_recv.clone(),
        );

        let result = driver.start().await;

        derivation_handle.abort();
        submitter_handle.abort();
        mempool.flush_wal();

        match result {
            Ok(()) => Ok(()),
            Err(fatal) => {
                tracing::error!(%fatal, "fatal invariant violation");
                Err(eyre::eyre!(fatal))
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::AccountState;
    use crate::transaction::test_utils::signed_legacy;
    use alloy_primitives::Address;
    use async_trait::async_trait;
    use secp256k1::SecretKey;

    struct OpenSource;

    #[async_trait]
    impl StateSource for OpenSource {
        async fn account(
            &self,
            _address: Address,
        ) -> Result<AccountState, crate::errors::ValidationError> {
            Ok(AccountState {
                nonce: 0,
                balance: U256::MAX,
            })
        }
    }

    fn admission(rate: u64, halted: bool) -> Admission<OpenSource> {
        Admission::new(
            Arc::new(Mempool::new(16)),
            Validator::new(Arc::new(OpenSource)),
            rate,
            halted,
        )
    }

    #[tokio::test]
    async fn admits_and_reports_duplicates() {
        let admission = admission(1000, false);
        let tx = signed_legacy(&SecretKey::from_slice(&[1; 32]).unwrap(), 0, 10);
        let hash = admission.submit(tx.raw.0.clone(), None).await.unwrap();
        assert_eq!(hash, tx.hash);

        let err = admission.submit(tx.raw.0.clone(), None).await.unwrap_err();
        assert_eq!(
            err,
            AdmissionError::Validation(crate::errors::ValidationError::DuplicateHash)
        );
    }

    #[tokio::test]
    async fn halt_flag_refuses_admission() {
        let admission = admission(1000, true);
        let tx = signed_legacy(&SecretKey::from_slice(&[1; 32]).unwrap(), 0, 10);
        assert_eq!(
            admission.submit(tx.raw.0, None).await.unwrap_err(),
            AdmissionError::Halted
        );
    }

    #[tokio::test]
    async fn rate_limit_kicks_in() {
        let admission = admission(1, false);
        let key = SecretKey::from_slice(&[1; 32]).unwrap();
        let first = signed_legacy(&key, 0, 10);
        let second = signed_legacy(&key, 1, 10);
        admission.submit(first.raw.0, None).await.unwrap();
        assert_eq!(
            admission.submit(second.raw.0, None).await.unwrap_err(),
            AdmissionError::RateLimited
        );
    }

    #[test]
    fn receipt_store_evicts_oldest() {
        let store = ReceiptStore::new(2);
        for i in 0..3u8 {
            store.insert(Receipt {
                transaction_hash: B256::repeat_byte(i),
                block_hash: B256::ZERO,
                block_number: i as u64,
                transaction_index: 0,
                status: 1,
            });
        }
        assert!(store.get(&B256::repeat_byte(0)).is_none());
        assert!(store.get(&B256::repeat_byte(1)).is_some());
        assert!(store.get(&B256::repeat_byte(2)).is_some());
    }
}
