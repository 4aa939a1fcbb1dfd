//! A [BlockFetchStarter] that fetches each block with its own rpc.

use crate::transport::TransportClientFactory;
use futures::StreamExt;
use shuffle_api::{fetch::*, transport::*, *};
use std::net::SocketAddr;

/// Fetches blocks from one remote address, one rpc per block.
///
/// Each call to [BlockFetchStarter::create_and_start] opens a new
/// connection, so a retry after a connection failure does not reuse the
/// broken connection. The rpc body is the block id, the response body is
/// the block data. The connection is closed once every block of the batch
/// has been reported.
#[derive(Debug, Clone)]
pub struct OneForOneBlockFetchStarter {
    client_factory: TransportClientFactory,
    address: SocketAddr,
}

impl OneForOneBlockFetchStarter {
    /// Construct a starter fetching from `address`.
    pub fn new(
        client_factory: TransportClientFactory,
        address: SocketAddr,
    ) -> Self {
        Self {
            client_factory,
            address,
        }
    }
}

impl BlockFetchStarter for OneForOneBlockFetchStarter {
    fn create_and_start(
        &self,
        block_ids: Vec<BlockId>,
        listener: DynBlockFetchingListener,
    ) -> BoxFut<'_, ShuffleResult<()>> {
        Box::pin(async move {
            let client = self.client_factory.create_client(self.address).await?;

            tracing::debug!(
                remote = %self.address,
                count = block_ids.len(),
                "fetching blocks"
            );

            tokio::task::spawn(async move {
                futures::stream::iter(block_ids)
                    .for_each_concurrent(None, |block_id| {
                        let client = client.clone();
                        let listener = listener.clone();
                        async move {
                            match client.send_rpc(block_id.to_bytes()).await {
                                Ok(data) => listener
                                    .on_block_fetch_success(block_id, data),
                                Err(err) => listener
                                    .on_block_fetch_failure(block_id, err),
                            }
                        }
                    })
                    .await;
                client.close();
            });

            Ok(())
        })
    }
}
