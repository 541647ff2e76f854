//! Derives the safe L2 head from batches that L1 has accepted.
//!
//! A single-threaded reader walks L1 block by block, extracts batch
//! calldata addressed to the inbox, and advances the safe head as derived
//! L2 blocks surpass it. A parent-hash mismatch against a previously
//! observed block triggers a rewind to the lowest common ancestor; rewinds
//! reaching the finalized head are fatal.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use alloy_primitives::{Address, B256};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};

use crate::{
    batcher::Batch,
    common::BlockInfo,
    errors::{FatalError, RpcCallError},
    l1::client::L1Api,
};

/// How long the reader idles when L1 has no new block.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Progress reported by the derivation worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivationEvent {
    /// Derivation produced a newly safe L2 block.
    SafeAdvanced {
        /// The new safe head
        safe: BlockInfo,
        /// The L1 block it was derived from
        l1_block: u64,
    },
    /// An L2 block crossed the confirmation depth.
    Finalized {
        /// The newly finalized head
        finalized: BlockInfo,
    },
    /// An L1 reorg rewound the safe head.
    Reorged {
        /// The safe head after the rewind
        safe: BlockInfo,
    },
    /// The reorg reached the finalized head; the operator must intervene.
    Fatal(FatalError),
}

#[derive(Debug, Clone, Copy)]
struct ObservedL1 {
    hash: B256,
    parent_hash: B256,
}

#[derive(Debug, Clone, Copy)]
struct DerivedRef {
    info: BlockInfo,
    l1_block: u64,
}

/// The derivation cursor and ledger. `last_l1_block_consumed` and the safe
/// head are monotone non-decreasing except on reorg.
#[derive(Debug)]
pub struct DerivationPipeline<L> {
    l1: Arc<L>,
    /// Only transactions to this address carry batches; `None` means try
    /// every transaction's calldata.
    inbox: Option<Address>,
    confirmation_depth: u64,
    /// last_l1_block_consumed
    cursor: u64,
    observed: BTreeMap<u64, ObservedL1>,
    derived: Vec<DerivedRef>,
    safe: BlockInfo,
    finalized: BlockInfo,
    /// The L1 block the finalized head was derived from.
    finalized_l1_block: u64,
}

impl<L: L1Api> DerivationPipeline<L> {
    /// A pipeline starting after `l1_start_block` with the given initial
    /// safe head.
    pub fn new(
        l1: Arc<L>,
        inbox: Option<Address>,
        confirmation_depth: u64,
        initial_safe: BlockInfo,
        l1_start_block: u64,
    ) -> Self {
        Self {
            l1,
            inbox,
            confirmation_depth,
            cursor: l1_start_block,
            observed: BTreeMap::new(),
            derived: Vec::new(),
            safe: initial_safe,
            finalized: initial_safe,
            finalized_l1_block: l1_start_block,
        }
    }

    /// The current derivation cursor `(last_l1_block_consumed, safe_head)`.
    pub fn cursor(&self) -> (u64, BlockInfo) {
        (self.cursor, self.safe)
    }

    /// Consumes at most one L1 block and reports any resulting progress.
    pub async fn step(&mut self) -> Result<Vec<DerivationEvent>, RpcCallError> {
        let latest = self.l1.latest_block().await?;
        let next = self.cursor + 1;

        if next > latest {
            // nothing new; verify the tip we already consumed still stands
            if let Some(observed) = self.observed.get(&self.cursor).copied() {
                if let Some(block) = self.l1.get_block(self.cursor, false).await? {
                    if block.hash != observed.hash {
                        return self.handle_reorg().await;
                    }
                }
            }
            return Ok(vec![]);
        }

        let Some(block) = self.l1.get_block(next, true).await? else {
            return Ok(vec![]);
        };

        if let Some(prev) = self.observed.get(&(next - 1)) {
            if block.parent_hash != prev.hash {
                return self.handle_reorg().await;
            }
        }

        self.observed.insert(
            next,
            ObservedL1 {
                hash: block.hash,
                parent_hash: block.parent_hash,
            },
        );

        let mut events = Vec::new();
        let mut derived_any = false;

        for tx in &block.transactions {
            if let Some(inbox) = self.inbox {
                if tx.to != Some(inbox) {
                    continue;
                }
            }
            let blocks = match Batch::decode_blocks(&tx.input) {
                Ok(blocks) => blocks,
                Err(err) => {
                    if self.inbox.is_some() {
                        tracing::warn!(l1_block = next, %err, "dropping invalid batch calldata");
                    }
                    continue;
                }
            };
            for l2_block in blocks {
                let info = l2_block.info();
                let highest = self
                    .derived
                    .last()
                    .map(|d| d.info.number)
                    .unwrap_or(self.safe.number);
                if info.number <= highest {
                    continue;
                }
                self.derived.push(DerivedRef {
                    info,
                    l1_block: next,
                });
                derived_any = true;
            }
        }

        if derived_any {
            if let Some(last) = self.derived.last() {
                if last.info.number > self.safe.number {
                    self.safe = last.info;
                    events.push(DerivationEvent::SafeAdvanced {
                        safe: self.safe,
                        l1_block: next,
                    });
                }
            }
        }

        // finality: derived blocks whose L1 inclusion is deeper than the
        // confirmation depth
        let finalized_l1 = latest.saturating_sub(self.confirmation_depth);
        let newly_finalized = self
            .derived
            .iter()
            .filter(|d| d.l1_block <= finalized_l1)
            .last()
            .copied();
        if let Some(frontier) = newly_finalized {
            if frontier.info.number > self.finalized.number {
                self.finalized = frontier.info;
                self.finalized_l1_block = frontier.l1_block;
                events.push(DerivationEvent::Finalized {
                    finalized: self.finalized,
                });
                self.derived.retain(|d| d.info.number >= self.finalized.number);
            }
        }

        // keep enough observed headers to find a reorg ancestor
        let horizon = (self.confirmation_depth * 2).max(64);
        self.observed.retain(|n, _| *n + horizon >= next);
        self.cursor = next;
        Ok(events)
    }

    /// Rewinds the cursor to the lowest common ancestor with the new L1
    /// chain and rewinds the safe head in lockstep.
    async fn handle_reorg(&mut self) -> Result<Vec<DerivationEvent>, RpcCallError> {
        tracing::warn!(cursor = self.cursor, "l1 reorg detected, searching common ancestor");

        let mut ancestor = None;
        for (number, observed) in self.observed.iter().rev() {
            if let Some(block) = self.l1.get_block(*number, false).await? {
                if block.hash == observed.hash {
                    ancestor = Some(*number);
                    break;
                }
            }
        }
        let ancestor =
            ancestor.unwrap_or_else(|| self.observed.keys().next().copied().unwrap_or(0).saturating_sub(1));

        if ancestor < self.finalized_l1_block {
            tracing::error!(
                ancestor,
                finalized_l1_block = self.finalized_l1_block,
                "reorg reaches below the finalized head"
            );
            return Ok(vec![DerivationEvent::Fatal(FatalError::FinalizedRewind(
                self.finalized.number,
            ))]);
        }

        self.observed.retain(|n, _| *n <= ancestor);
        let rewound: Vec<DerivedRef> = self
            .derived
            .iter()
            .filter(|d| d.l1_block > ancestor)
            .copied()
            .collect();
        if rewound.iter().any(|d| d.info.number <= self.finalized.number) {
            return Ok(vec![DerivationEvent::Fatal(FatalError::FinalizedRewind(
                self.finalized.number,
            ))]);
        }
        self.derived.retain(|d| d.l1_block <= ancestor);

        self.cursor = ancestor;
        let new_safe = self
            .derived
            .last()
            .map(|d| d.info)
            .unwrap_or(self.finalized);

        tracing::warn!(
            ancestor,
            safe = new_safe.number,
            "rewound derivation cursor and safe head"
        );
        self.safe = new_safe;
        Ok(vec![DerivationEvent::Reorged { safe: new_safe }])
    }

    /// Runs the reader until shutdown or a fatal event, forwarding progress
    /// into `events`.
    pub fn spawn(
        mut self,
        events: mpsc::Sender<DerivationEvent>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }
                match self.step().await {
                    Ok(produced) => {
                        let idle = produced.is_empty();
                        for event in produced {
                            let fatal = matches!(event, DerivationEvent::Fatal(_));
                            if events.send(event).await.is_err() {
                                return;
                            }
                            if fatal {
                                return;
                            }
                        }
                        if idle {
                            tokio::select! {
                                _ = sleep(IDLE_POLL) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(cursor = self.cursor, %err, "derivation step failed");
                        tokio::select! {
                            _ = sleep(IDLE_POLL) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
            }
        })
    }
}
