//! The unsafe/safe/finalized block-state machine.
//!
//! A block proposed by this sequencer enters as Unsafe, becomes Safe once
//! derived from L1, and Finalized once its deriving L1 block is deeper than
//! the confirmation depth. A block may skip Unsafe when the node is catching
//! up from L1 alone. Heights are monotone; finalized never rewinds.

use std::sync::{Arc, RwLock};

use crate::{common::BlockInfo, errors::FatalError};

/// A consistent view of the three heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeadsSnapshot {
    /// Most recent block proposed by this sequencer
    pub unsafe_head: BlockInfo,
    /// Most recent block derived from L1
    pub safe_head: BlockInfo,
    /// Most recent block derived from L1 past the confirmation depth
    pub finalized_head: BlockInfo,
}

/// The three current references. Owned by the sequencing loop; other
/// workers read through [`SharedBlockState::snapshot`].
#[derive(Debug, Default)]
pub struct BlockState {
    unsafe_head: BlockInfo,
    safe_head: BlockInfo,
    finalized_head: BlockInfo,
}

impl BlockState {
    /// Starts all three heads at the given genesis reference.
    pub fn new(genesis: BlockInfo) -> Self {
        Self {
            unsafe_head: genesis,
            safe_head: genesis,
            finalized_head: genesis,
        }
    }

    /// Installs a newly proposed block as the unsafe head.
    ///
    /// Panics if height decreases: only [`BlockState::reorg_safe`] may
    /// rewind, and only atomically.
    pub fn set_unsafe(&mut self, block: BlockInfo) {
        assert!(
            block.number >= self.unsafe_head.number,
            "unsafe head rewind outside a reorg: {} < {}",
            block.number,
            self.unsafe_head.number
        );
        self.unsafe_head = block;
    }

    /// Advances the safe head to a block derived from L1. The unsafe head
    /// is pulled forward when derivation overtakes local proposals.
    ///
    /// Panics if height decreases outside a reorg.
    pub fn set_safe(&mut self, block: BlockInfo) {
        assert!(
            block.number >= self.safe_head.number,
            "safe head rewind outside a reorg: {} < {}",
            block.number,
            self.safe_head.number
        );
        self.safe_head = block;
        if self.unsafe_head.number < block.number {
            self.unsafe_head = block;
        }
    }

    /// Advances the finalized head. Rewinding finalized is fatal.
    pub fn set_finalized(&mut self, block: BlockInfo) -> Result<(), FatalError> {
        if block.number < self.finalized_head.number {
            return Err(FatalError::FinalizedRewind(block.number));
        }
        self.finalized_head = block;
        if self.safe_head.number < block.number {
            self.safe_head = block;
        }
        if self.unsafe_head.number < block.number {
            self.unsafe_head = block;
        }
        Ok(())
    }

    /// Rewinds the safe head after an L1 reorg, atomically. The unsafe head
    /// is pulled back in lockstep. A target below finalized is fatal.
    pub fn reorg_safe(&mut self, block: BlockInfo) -> Result<(), FatalError> {
        if block.number < self.finalized_head.number {
            return Err(FatalError::FinalizedRewind(block.number));
        }
        self.safe_head = block;
        if self.unsafe_head.number > block.number {
            self.unsafe_head = block;
        }
        Ok(())
    }

    /// The three heads as one consistent view.
    pub fn snapshot(&self) -> HeadsSnapshot {
        HeadsSnapshot {
            unsafe_head: self.unsafe_head,
            safe_head: self.safe_head,
            finalized_head: self.finalized_head,
        }
    }
}

/// Shared handle around [`BlockState`]. The sequencing loop holds the only
/// writer; admission and derivation workers read snapshots.
#[derive(Debug, Clone, Default)]
pub struct SharedBlockState(Arc<RwLock<BlockState>>);

impl SharedBlockState {
    /// Wraps a fresh state starting from `genesis`.
    pub fn new(genesis: BlockInfo) -> Self {
        Self(Arc::new(RwLock::new(BlockState::new(genesis))))
    }

    /// An atomic copy of the three heads.
    pub fn snapshot(&self) -> HeadsSnapshot {
        self.0.read().expect("block state lock poisoned").snapshot()
    }

    /// Runs `f` with exclusive access to the state.
    pub fn update<T>(&self, f: impl FnOnce(&mut BlockState) -> T) -> T {
        let mut state = self.0.write().expect("block state lock poisoned");
        f(&mut state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    fn info(number: u64) -> BlockInfo {
        BlockInfo {
            hash: B256::repeat_byte(number as u8),
            number,
            parent_hash: B256::repeat_byte(number.saturating_sub(1) as u8),
            timestamp: number * 2,
        }
    }

    #[test]
    fn heights_stay_ordered() {
        let mut state = BlockState::new(info(0));
        state.set_unsafe(info(5));
        state.set_safe(info(3));
        state.set_finalized(info(1)).unwrap();
        let snap = state.snapshot();
        assert!(snap.finalized_head.number <= snap.safe_head.number);
        assert!(snap.safe_head.number <= snap.unsafe_head.number);
    }

    #[test]
    fn safe_advance_pulls_unsafe_forward() {
        let mut state = BlockState::new(info(0));
        state.set_safe(info(4));
        assert_eq!(state.snapshot().unsafe_head.number, 4);
    }

    #[test]
    fn finalized_rewind_is_fatal() {
        let mut state = BlockState::new(info(0));
        state.set_unsafe(info(9));
        state.set_safe(info(9));
        state.set_finalized(info(8)).unwrap();
        assert!(matches!(
            state.set_finalized(info(3)),
            Err(FatalError::FinalizedRewind(3))
        ));
    }

    #[test]
    fn reorg_rewinds_safe_and_unsafe_atomically() {
        let mut state = BlockState::new(info(0));
        state.set_unsafe(info(10));
        state.set_safe(info(8));
        state.set_finalized(info(2)).unwrap();

        state.reorg_safe(info(5)).unwrap();
        let snap = state.snapshot();
        assert_eq!(snap.safe_head.number, 5);
        assert_eq!(snap.unsafe_head.number, 5);
        assert_eq!(snap.finalized_head.number, 2);
    }

    #[test]
    fn reorg_below_finalized_is_fatal() {
        let mut state = BlockState::new(info(0));
        state.set_unsafe(info(10));
        state.set_safe(info(8));
        state.set_finalized(info(6)).unwrap();
        assert!(matches!(
            state.reorg_safe(info(4)),
            Err(FatalError::FinalizedRewind(4))
        ));
    }

    #[test]
    fn shared_snapshot_is_consistent() {
        let shared = SharedBlockState::new(info(0));
        shared.update(|s| s.set_unsafe(info(3)));
        assert_eq!(shared.snapshot().unsafe_head.number, 3);
    }
}
