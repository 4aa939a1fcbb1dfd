//! A fetch listener that records every outcome it receives.

use shuffle_api::{fetch::*, *};
use std::sync::{Arc, Mutex};

/// One outcome reported to a [RecordingListener].
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The block was fetched.
    Success(BlockId, bytes::Bytes),
    /// The block could not be fetched.
    Failure(BlockId, ShuffleError),
}

impl FetchOutcome {
    /// The block this outcome is for.
    pub fn block_id(&self) -> &BlockId {
        match self {
            FetchOutcome::Success(id, _) => id,
            FetchOutcome::Failure(id, _) => id,
        }
    }
}

/// Records outcomes in the order they were reported.
#[derive(Debug, Default)]
pub struct RecordingListener {
    outcomes: Mutex<Vec<FetchOutcome>>,
}

impl RecordingListener {
    /// Construct a new listener, ready to be handed to a fetcher.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every outcome reported so far.
    pub fn outcomes(&self) -> Vec<FetchOutcome> {
        self.outcomes.lock().unwrap().clone()
    }

    /// Number of outcomes reported so far.
    pub fn len(&self) -> usize {
        self.outcomes.lock().unwrap().len()
    }

    /// Returns true if nothing was reported yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The successfully fetched blocks, in reporting order.
    pub fn successes(&self) -> Vec<(BlockId, bytes::Bytes)> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .filter_map(|o| match o {
                FetchOutcome::Success(id, data) => {
                    Some((id.clone(), data.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// The failed blocks, in reporting order.
    pub fn failures(&self) -> Vec<(BlockId, ShuffleError)> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .filter_map(|o| match o {
                FetchOutcome::Failure(id, err) => {
                    Some((id.clone(), err.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// How many outcomes were reported for `block_id`.
    pub fn count_for(&self, block_id: &BlockId) -> usize {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.block_id() == block_id)
            .count()
    }
}

impl BlockFetchingListener for RecordingListener {
    fn on_block_fetch_success(&self, block_id: BlockId, data: bytes::Bytes) {
        self.outcomes
            .lock()
            .unwrap()
            .push(FetchOutcome::Success(block_id, data));
    }

    fn on_block_fetch_failure(&self, block_id: BlockId, err: ShuffleError) {
        self.outcomes
            .lock()
            .unwrap()
            .push(FetchOutcome::Failure(block_id, err));
    }
}
