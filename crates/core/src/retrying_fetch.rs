//! Retrying block fetch.
//!
//! A [RetryingBlockFetcher] fetches a batch of blocks through a
//! [BlockFetchStarter], retries blocks that failed with I/O errors, and
//! reports exactly one outcome per block to the caller's
//! [BlockFetchingListener].
//!
//! ### Attempts
//!
//! Each call to the starter is an attempt, and each attempt gets its own
//! listener tagged with a generation number. Starting a retry bumps the
//! generation, which turns every listener of earlier attempts inert: their
//! late completions are dropped. A retry always re-requests all blocks that
//! are still outstanding, in the order they were first requested.
//!
//! ### Outstanding blocks
//!
//! A block stays outstanding until its outcome has been forwarded to the
//! caller. It is removed from the outstanding list at the moment of
//! forwarding, and only if the completion comes from the current attempt,
//! so a block can never be reported twice.
//!
//! ### Retries
//!
//! A failure is retried if its error is, or wraps, a [std::io::Error] and
//! fewer than `ioMaxRetries` retries have been made. Retries are started
//! `ioRetryWaitMs` after the failure, on the tokio runtime the fetcher was
//! created on. Other failures are reported to the caller immediately.

use crate::transport::TransportConfig;
use shuffle_api::{fetch::*, *};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

#[derive(Debug)]
struct State {
    retry_count: u32,
    generation: u64,
    outstanding: Vec<BlockId>,
}

impl State {
    /// Returns true if `block_id` was outstanding.
    fn remove_outstanding(&mut self, block_id: &BlockId) -> bool {
        match self.outstanding.iter().position(|id| id == block_id) {
            Some(idx) => {
                self.outstanding.remove(idx);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct Inner {
    fetch_starter: DynBlockFetchStarter,
    listener: DynBlockFetchingListener,
    max_retries: u32,
    retry_wait: Duration,
    runtime: tokio::runtime::Handle,
    state: Mutex<State>,
}

/// Fetches a batch of blocks, retrying I/O failures.
///
/// The fetch keeps running after the fetcher is dropped, until every block
/// has been reported to the listener.
#[derive(Debug, Clone)]
pub struct RetryingBlockFetcher {
    inner: Arc<Inner>,
}

impl RetryingBlockFetcher {
    /// Construct a new fetcher for `block_ids`.
    ///
    /// Duplicate ids are fetched and reported once. Fails if `block_ids`
    /// is empty, or if called outside of a tokio runtime.
    pub fn new(
        config: &TransportConfig,
        fetch_starter: DynBlockFetchStarter,
        block_ids: Vec<BlockId>,
        listener: DynBlockFetchingListener,
    ) -> ShuffleResult<Self> {
        if block_ids.is_empty() {
            return Err(ShuffleError::other(
                "retrying fetch requires at least one block id",
            ));
        }

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|err| {
                ShuffleError::other_src(
                    "retrying fetch requires a tokio runtime",
                    err,
                )
            })?;

        let requested = block_ids.len();
        let mut outstanding = Vec::with_capacity(requested);
        for block_id in block_ids {
            if !outstanding.contains(&block_id) {
                outstanding.push(block_id);
            }
        }
        if outstanding.len() < requested {
            tracing::debug!(
                requested,
                unique = outstanding.len(),
                "ignoring duplicate block ids"
            );
        }

        Ok(Self {
            inner: Arc::new(Inner {
                fetch_starter,
                listener,
                max_retries: config.io_max_retries,
                retry_wait: config.io_retry_wait(),
                runtime,
                state: Mutex::new(State {
                    retry_count: 0,
                    generation: 0,
                    outstanding,
                }),
            }),
        })
    }

    /// Start fetching. Returns immediately, outcomes are delivered to the
    /// listener from background tasks.
    pub fn start(&self) {
        self.inner
            .runtime
            .spawn(fetch_all_outstanding(self.inner.clone()));
    }

    /// How many retries were started so far.
    pub fn retry_count(&self) -> u32 {
        self.inner.state.lock().unwrap().retry_count
    }

    /// Blocks that have not been reported to the listener yet, in the
    /// order they were requested.
    pub fn outstanding_block_ids(&self) -> Vec<BlockId> {
        self.inner.state.lock().unwrap().outstanding.clone()
    }
}

impl Inner {
    fn is_retryable(&self, err: &ShuffleError, retry_count: u32) -> bool {
        err.is_transient() && retry_count < self.max_retries
    }
}

/// Boxed so that a retry task can call back into this function.
fn fetch_all_outstanding(inner: Arc<Inner>) -> BoxFut<'static, ()> {
    Box::pin(async move {
        let (block_ids, retry_count, generation) = {
            let lock = inner.state.lock().unwrap();
            (lock.outstanding.clone(), lock.retry_count, lock.generation)
        };

        if block_ids.is_empty() {
            return;
        }

        if retry_count > 0 {
            tracing::info!(
                retry_count,
                outstanding = block_ids.len(),
                "retrying fetch of outstanding blocks"
            );
        }

        let listener: DynBlockFetchingListener = Arc::new(AttemptListener {
            inner: inner.clone(),
            generation,
        });

        if let Err(err) = inner
            .fetch_starter
            .create_and_start(block_ids.clone(), listener)
            .await
        {
            tracing::error!(
                ?err,
                retry_count,
                outstanding = block_ids.len(),
                "failed to start block fetch"
            );
            handle_start_failure(&inner, generation, block_ids, err);
        }
    })
}

fn handle_start_failure(
    inner: &Arc<Inner>,
    generation: u64,
    block_ids: Vec<BlockId>,
    err: ShuffleError,
) {
    let failed = {
        let mut lock = inner.state.lock().unwrap();
        if lock.generation != generation {
            tracing::debug!(
                generation,
                "ignoring start failure of a superseded attempt"
            );
            return;
        }
        if inner.is_retryable(&err, lock.retry_count) {
            begin_retry(&mut lock);
            None
        } else {
            Some(
                block_ids
                    .into_iter()
                    .filter(|id| lock.remove_outstanding(id))
                    .collect::<Vec<_>>(),
            )
        }
    };

    match failed {
        None => schedule_retry(inner),
        Some(failed) => {
            for block_id in failed {
                inner.listener.on_block_fetch_failure(block_id, err.clone());
            }
        }
    }
}

/// Makes the current attempt stale. Must be followed by
/// [schedule_retry] once the lock is released.
fn begin_retry(state: &mut State) {
    state.retry_count += 1;
    state.generation += 1;
}

fn schedule_retry(inner: &Arc<Inner>) {
    let (retry_count, outstanding) = {
        let lock = inner.state.lock().unwrap();
        (lock.retry_count, lock.outstanding.len())
    };
    tracing::info!(
        retry_count,
        max_retries = inner.max_retries,
        outstanding,
        wait = ?inner.retry_wait,
        "retrying block fetch"
    );

    let task_inner = inner.clone();
    inner.runtime.spawn(async move {
        if !task_inner.retry_wait.is_zero() {
            tokio::time::sleep(task_inner.retry_wait).await;
        }
        fetch_all_outstanding(task_inner).await;
    });
}

/// The listener handed to the starter for one attempt.
#[derive(Debug)]
struct AttemptListener {
    inner: Arc<Inner>,
    generation: u64,
}

impl BlockFetchingListener for AttemptListener {
    fn on_block_fetch_success(&self, block_id: BlockId, data: bytes::Bytes) {
        let forward = {
            let mut lock = self.inner.state.lock().unwrap();
            lock.generation == self.generation
                && lock.remove_outstanding(&block_id)
        };

        if forward {
            self.inner.listener.on_block_fetch_success(block_id, data);
        } else {
            tracing::trace!(
                %block_id,
                generation = self.generation,
                "dropping stale or duplicate fetch success"
            );
        }
    }

    fn on_block_fetch_failure(&self, block_id: BlockId, err: ShuffleError) {
        enum Action {
            Drop,
            Retry,
            Forward,
        }

        let action = {
            let mut lock = self.inner.state.lock().unwrap();
            if lock.generation != self.generation
                || !lock.outstanding.contains(&block_id)
            {
                Action::Drop
            } else if self.inner.is_retryable(&err, lock.retry_count) {
                begin_retry(&mut lock);
                Action::Retry
            } else {
                lock.remove_outstanding(&block_id);
                Action::Forward
            }
        };

        match action {
            Action::Drop => {
                tracing::trace!(
                    ?err,
                    %block_id,
                    generation = self.generation,
                    "dropping stale or duplicate fetch failure"
                );
            }
            Action::Retry => {
                tracing::debug!(
                    ?err,
                    %block_id,
                    "block fetch failed, retrying"
                );
                schedule_retry(&self.inner);
            }
            Action::Forward => {
                tracing::warn!(?err, %block_id, "block fetch failed");
                self.inner.listener.on_block_fetch_failure(block_id, err);
            }
        }
    }
}
