//! The pending transaction pool: priority-ordered, capacity-bounded, with
//! durable admission through a write-ahead log and conditional-inclusion
//! predicates evaluated at selection time.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, RwLock,
    },
};

use alloy_primitives::{Address, B256, U256};

use crate::{
    errors::MempoolError,
    transaction::ParsedTransaction,
};

pub mod wal;

use wal::{FsyncPolicy, ReplayReport, Wal, WalRecord};

/// Optional inclusive bounds a candidate block must satisfy before the
/// transaction becomes eligible for selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InclusionPredicate {
    /// Lowest block number the transaction may be included in
    pub block_number_min: Option<u64>,
    /// Highest block number the transaction may be included in
    pub block_number_max: Option<u64>,
    /// Earliest block timestamp the transaction may be included at
    pub timestamp_min: Option<u64>,
    /// Latest block timestamp the transaction may be included at
    pub timestamp_max: Option<u64>,
}

impl InclusionPredicate {
    /// True when every specified bound holds for the candidate block.
    pub fn satisfied_by(&self, block_number: u64, timestamp: u64) -> bool {
        self.block_number_min.map_or(true, |min| block_number >= min)
            && self.block_number_max.map_or(true, |max| block_number <= max)
            && self.timestamp_min.map_or(true, |min| timestamp >= min)
            && self.timestamp_max.map_or(true, |max| timestamp <= max)
    }

    /// True when no bound is specified at all.
    pub fn is_empty(&self) -> bool {
        *self == InclusionPredicate::default()
    }

    fn to_record_fields(self) -> (u8, u64, u64, u64, u64) {
        let mut flags = 0u8;
        let mut set = |bit: u8, v: Option<u64>| {
            if v.is_some() {
                flags |= 1 << bit;
            }
            v.unwrap_or(0)
        };
        let bn_min = set(0, self.block_number_min);
        let bn_max = set(1, self.block_number_max);
        let ts_min = set(2, self.timestamp_min);
        let ts_max = set(3, self.timestamp_max);
        (flags, bn_min, bn_max, ts_min, ts_max)
    }

    fn from_record(record: &WalRecord) -> Option<Self> {
        if record.flags == 0 {
            return None;
        }
        let get = |bit: u8, v: u64| (record.flags & (1 << bit) != 0).then_some(v);
        Some(InclusionPredicate {
            block_number_min: get(0, record.block_number_min),
            block_number_max: get(1, record.block_number_max),
            timestamp_min: get(2, record.timestamp_min),
            timestamp_max: get(3, record.timestamp_max),
        })
    }
}

/// The result of an insert attempt. `DuplicateHash` and `Full` leave the
/// pool unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry is in the pool and durably logged.
    Inserted,
    /// An entry with the same hash is already live.
    DuplicateHash,
    /// The pool is at capacity.
    Full,
}

/// Selection inputs for one payload-building tick.
#[derive(Debug, Clone, Default)]
pub struct SelectionParams {
    /// Cumulative gas ceiling across selected transactions
    pub gas_budget: u64,
    /// Maximum number of transactions to select
    pub max_count: usize,
    /// Number of the block being built, for predicate evaluation
    pub block_number: u64,
    /// Timestamp of the block being built, for predicate evaluation
    pub timestamp: u64,
    /// Current account nonces, used to enforce per-sender contiguity.
    /// Senders absent from the map start from their lowest pooled nonce.
    pub base_nonces: HashMap<Address, u64>,
}

/// Ordering key: priority descending, then received-at ascending, then hash
/// as the final deterministic tiebreak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PoolKey {
    priority: Reverse<U256>,
    received_at: u64,
    hash: B256,
}

#[derive(Debug, Clone)]
struct PoolEntry {
    tx: ParsedTransaction,
    predicate: Option<InclusionPredicate>,
}

#[derive(Default)]
struct PoolInner {
    entries: BTreeMap<PoolKey, PoolEntry>,
    by_hash: HashMap<B256, PoolKey>,
    by_sender: HashMap<Address, Vec<B256>>,
}

impl PoolInner {
    fn insert(&mut self, key: PoolKey, entry: PoolEntry) {
        self.by_hash.insert(key.hash, key);
        self.by_sender
            .entry(entry.tx.sender)
            .or_default()
            .push(key.hash);
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, hash: &B256) -> Option<PoolEntry> {
        let key = self.by_hash.remove(hash)?;
        let entry = self.entries.remove(&key)?;
        if let Some(hashes) = self.by_sender.get_mut(&entry.tx.sender) {
            hashes.retain(|h| h != hash);
            if hashes.is_empty() {
                self.by_sender.remove(&entry.tx.sender);
            }
        }
        Some(entry)
    }
}

/// The internally synchronized pending pool. `insert`, `remove`, `contains`
/// and `by_sender` may be called concurrently; `select` takes the writer
/// lock for its whole walk and is linearizable against inserts.
pub struct Mempool {
    max_size: usize,
    inner: RwLock<PoolInner>,
    wal: Option<Mutex<Wal>>,
    seq: AtomicU64,
}

impl Mempool {
    /// An in-memory pool without durability.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: RwLock::new(PoolInner::default()),
            wal: None,
            seq: AtomicU64::new(0),
        }
    }

    /// Opens the WAL at `path`, replays it through `revalidate` (entries
    /// failing re-validation are dropped with a warning), and returns the
    /// recovered pool.
    pub fn recover(
        max_size: usize,
        path: impl AsRef<Path>,
        policy: FsyncPolicy,
        mut revalidate: impl FnMut(&ParsedTransaction) -> bool,
    ) -> Result<(Self, ReplayReport), crate::errors::FatalError> {
        let (records, report) = Wal::replay(&path)?;
        let wal = Wal::open(&path, policy)
            .map_err(|e| crate::errors::FatalError::WalCorruption(e.to_string()))?;

        let pool = Self {
            max_size,
            inner: RwLock::new(PoolInner::default()),
            wal: None,
            seq: AtomicU64::new(0),
        };

        let mut dropped = 0usize;
        for record in &records {
            let parsed =
                match ParsedTransaction::parse(crate::common::RawTransaction(record.raw.clone())) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        tracing::warn!("dropping unparseable wal entry: {err}");
                        dropped += 1;
                        continue;
                    }
                };
            if !revalidate(&parsed) {
                tracing::warn!(hash = ?parsed.hash, "dropping wal entry that failed re-validation");
                dropped += 1;
                continue;
            }
            let predicate = InclusionPredicate::from_record(record);
            if pool.insert_visible(parsed, predicate) != InsertOutcome::Inserted {
                dropped += 1;
            }
        }
        tracing::info!(
            replayed = report.replayed,
            dropped,
            "mempool recovered from wal"
        );

        let pool = Self {
            wal: Some(Mutex::new(wal)),
            ..pool
        };
        Ok((pool, report))
    }

    /// Admits a transaction. The WAL append happens before the entry is
    /// visible to readers; a WAL failure aborts the insert.
    pub fn insert(
        &self,
        tx: ParsedTransaction,
        predicate: Option<InclusionPredicate>,
    ) -> Result<InsertOutcome, MempoolError> {
        {
            let inner = self.inner.read().expect("mempool lock poisoned");
            if inner.by_hash.contains_key(&tx.hash) {
                return Ok(InsertOutcome::DuplicateHash);
            }
            if inner.entries.len() >= self.max_size {
                return Ok(InsertOutcome::Full);
            }
        }

        if let Some(wal) = &self.wal {
            let (flags, bn_min, bn_max, ts_min, ts_max) =
                predicate.unwrap_or_default().to_record_fields();
            let record = WalRecord {
                raw: tx.raw.0.clone(),
                flags,
                block_number_min: bn_min,
                block_number_max: bn_max,
                timestamp_min: ts_min,
                timestamp_max: ts_max,
            };
            wal.lock()
                .expect("wal lock poisoned")
                .append(&record)
                .map_err(|e| MempoolError::Wal(e.to_string()))?;
        }

        Ok(self.insert_visible(tx, predicate))
    }

    fn insert_visible(
        &self,
        tx: ParsedTransaction,
        predicate: Option<InclusionPredicate>,
    ) -> InsertOutcome {
        let mut inner = self.inner.write().expect("mempool lock poisoned");
        // re-checked under the writer lock: insert may race with insert
        if inner.by_hash.contains_key(&tx.hash) {
            return InsertOutcome::DuplicateHash;
        }
        if inner.entries.len() >= self.max_size {
            return InsertOutcome::Full;
        }
        let key = PoolKey {
            priority: Reverse(tx.tx.gas_price()),
            received_at: self.seq.fetch_add(1, Ordering::SeqCst),
            hash: tx.hash,
        };
        inner.insert(key, PoolEntry { tx, predicate });
        InsertOutcome::Inserted
    }

    /// Removes and returns the entry with the given hash.
    pub fn remove(&self, hash: &B256) -> Option<ParsedTransaction> {
        let mut inner = self.inner.write().expect("mempool lock poisoned");
        inner.remove(hash).map(|entry| entry.tx)
    }

    /// True when an entry with the given hash is live.
    pub fn contains(&self, hash: &B256) -> bool {
        self.inner
            .read()
            .expect("mempool lock poisoned")
            .by_hash
            .contains_key(hash)
    }

    /// All pooled transactions from one sender, nonce ascending.
    pub fn by_sender(&self, sender: &Address) -> Vec<ParsedTransaction> {
        let inner = self.inner.read().expect("mempool lock poisoned");
        let mut txs: Vec<ParsedTransaction> = inner
            .by_sender
            .get(sender)
            .into_iter()
            .flatten()
            .filter_map(|hash| {
                let key = inner.by_hash.get(hash)?;
                inner.entries.get(key).map(|entry| entry.tx.clone())
            })
            .collect();
        txs.sort_by_key(|tx| tx.tx.nonce());
        txs
    }

    /// Every sender with at least one pooled transaction.
    pub fn senders(&self) -> Vec<Address> {
        self.inner
            .read()
            .expect("mempool lock poisoned")
            .by_sender
            .keys()
            .copied()
            .collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.read().expect("mempool lock poisoned").entries.len()
    }

    /// True when the pool holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-destructively selects transactions for the next payload in
    /// priority order, skipping entries whose predicate fails against the
    /// candidate block, entries that break per-sender nonce contiguity, and
    /// entries that do not fit the remaining gas budget. Skipped entries
    /// stay in the pool at their original position.
    pub fn select(&self, params: &SelectionParams) -> Vec<ParsedTransaction> {
        let inner = self.inner.write().expect("mempool lock poisoned");

        let mut expected: HashMap<Address, u64> = params.base_nonces.clone();
        for (sender, hashes) in &inner.by_sender {
            expected.entry(*sender).or_insert_with(|| {
                hashes
                    .iter()
                    .filter_map(|hash| {
                        let key = inner.by_hash.get(hash)?;
                        inner.entries.get(key).map(|e| e.tx.tx.nonce())
                    })
                    .min()
                    .unwrap_or(0)
            });
        }

        let mut selected = Vec::new();
        let mut selected_hashes: std::collections::HashSet<B256> = Default::default();
        let mut gas_left = params.gas_budget;

        // top-k walk repeated to a fixpoint: admitting a nonce can unlock a
        // higher-priority successor from the same sender seen earlier
        loop {
            let mut progressed = false;
            for entry in inner.entries.values() {
                if selected.len() >= params.max_count {
                    break;
                }
                if selected_hashes.contains(&entry.tx.hash) {
                    continue;
                }
                if let Some(predicate) = &entry.predicate {
                    if !predicate.satisfied_by(params.block_number, params.timestamp) {
                        continue;
                    }
                }
                let next_nonce = expected
                    .get(&entry.tx.sender)
                    .copied()
                    .unwrap_or(entry.tx.tx.nonce());
                if entry.tx.tx.nonce() != next_nonce {
                    continue;
                }
                let gas = entry.tx.tx.gas_limit();
                if gas > gas_left {
                    continue;
                }
                gas_left -= gas;
                expected.insert(entry.tx.sender, next_nonce + 1);
                selected_hashes.insert(entry.tx.hash);
                selected.push(entry.tx.clone());
                progressed = true;
            }
            if !progressed || selected.len() >= params.max_count {
                break;
            }
        }

        selected
    }

    /// Forces any buffered WAL records to disk.
    pub fn flush_wal(&self) {
        if let Some(wal) = &self.wal {
            if let Err(err) = wal.lock().expect("wal lock poisoned").flush() {
                tracing::warn!("wal flush failed: {err}");
            }
        }
    }
}

impl std::fmt::Debug for Mempool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mempool")
            .field("max_size", &self.max_size)
            .field("len", &self.len())
            .finish()
    }
}
