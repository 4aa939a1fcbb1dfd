//! An rpc handler that serves blocks out of memory.

use shuffle_api::{transport::*, *};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

/// Serves blocks from a map. The request body is the block id, the
/// response body is the block data. Unknown blocks fail the request.
#[derive(Debug, Default)]
pub struct MemBlockRpcHandler {
    blocks: HashMap<BlockId, bytes::Bytes>,
    drop_connection_once: Mutex<HashSet<BlockId>>,
    requests: Mutex<HashMap<BlockId, usize>>,
}

impl MemBlockRpcHandler {
    /// Construct a handler serving `blocks`.
    pub fn new(
        blocks: impl IntoIterator<Item = (BlockId, bytes::Bytes)>,
    ) -> Self {
        Self {
            blocks: blocks.into_iter().collect(),
            ..Default::default()
        }
    }

    /// The first request for `block_id` closes the connection it arrived
    /// on instead of being answered.
    pub fn with_dropped_connection_once(self, block_id: BlockId) -> Self {
        self.drop_connection_once.lock().unwrap().insert(block_id);
        self
    }

    /// How many times `block_id` was requested.
    pub fn request_count(&self, block_id: &BlockId) -> usize {
        self.requests
            .lock()
            .unwrap()
            .get(block_id)
            .copied()
            .unwrap_or(0)
    }
}

impl RpcHandler for MemBlockRpcHandler {
    fn receive(
        &self,
        client: DynTransportClient,
        message: bytes::Bytes,
    ) -> BoxFut<'_, ShuffleResult<bytes::Bytes>> {
        Box::pin(async move {
            let block_id = BlockId::from_bytes(&message)?;
            *self
                .requests
                .lock()
                .unwrap()
                .entry(block_id.clone())
                .or_default() += 1;

            if self.drop_connection_once.lock().unwrap().remove(&block_id) {
                tracing::debug!(%block_id, "dropping connection");
                client.close();
                // the connection task aborts us
                return std::future::pending().await;
            }

            self.blocks.get(&block_id).cloned().ok_or_else(|| {
                ShuffleError::other(format!("block {block_id} not found"))
            })
        })
    }
}
