//! Block fetch types.

use crate::{BlockId, BoxFut, ShuffleError, ShuffleResult};
use std::sync::Arc;

/// Receives the outcome of block fetches.
///
/// Implementations may be called concurrently from any thread and must not
/// block for long; heavy work should be handed off to another task.
pub trait BlockFetchingListener: 'static + Send + Sync + std::fmt::Debug {
    /// A block was fetched successfully.
    fn on_block_fetch_success(&self, block_id: BlockId, data: bytes::Bytes);

    /// A block could not be fetched.
    fn on_block_fetch_failure(&self, block_id: BlockId, err: ShuffleError);
}

/// Trait-object [BlockFetchingListener].
pub type DynBlockFetchingListener = Arc<dyn BlockFetchingListener>;

/// Initiates the fetch of a batch of blocks.
///
/// Used by retrying fetchers both for the first attempt and for every retry
/// of the blocks still outstanding.
pub trait BlockFetchStarter: 'static + Send + Sync + std::fmt::Debug {
    /// Begin fetching `block_ids`, reporting each outcome to `listener`.
    ///
    /// The returned future resolves once the fetch has been issued. Every
    /// block in `block_ids` must eventually be reported to the listener,
    /// exactly once, unless the future resolves to an error, in which case
    /// nothing was issued and the listener must not be called at all.
    ///
    /// Implementations should obtain a fresh transport client on each call,
    /// so that a retry has a chance to recover from a broken connection.
    fn create_and_start(
        &self,
        block_ids: Vec<BlockId>,
        listener: DynBlockFetchingListener,
    ) -> BoxFut<'_, ShuffleResult<()>>;
}

/// Trait-object [BlockFetchStarter].
pub type DynBlockFetchStarter = Arc<dyn BlockFetchStarter>;
