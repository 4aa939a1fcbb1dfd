//! Transport is the shuffle module that wires raw byte streams into
//! request/response channels.
//!
//! A [TransportContext] holds the configuration and the application
//! [RpcHandler]. It creates [TransportClientFactory] and [TransportServer]
//! instances, and both of them call
//! [TransportContext::initialize_pipeline] on every new connection.
//!
//! ### Connection pipeline
//!
//! Every connection, client or server side, gets the same stages:
//!
//! - message encoder: outbound [TransportMessage]s to frame payloads
//! - frame decoder: length-delimited framing, bounded by `maxFrameBytes`
//! - message decoder: inbound frame payloads to [TransportMessage]s
//! - idle monitor: notices when nothing was read or written for
//!   `connectionTimeoutMs`
//! - channel handler: the [TransportChannelHandler] multiplexing requests
//!   and responses, bound to the [ChannelClient] of the connection
//!
//! Because the channel handler and its client are created together per
//! connection, a server can push messages to a client over the same client
//! handle the server-side [RpcHandler] receives with each request.
//!
//! ### Idle connections
//!
//! A connection with no reads or writes for the timeout becomes idle. If
//! requests are outstanding at that point, the remote is assumed dead: the
//! requests fail with a timed-out I/O error and the connection is closed.
//! Otherwise the connection is closed only if the context was created with
//! `close_idle_connections`.
//!
//! [TransportMessage]: shuffle_api::protocol::TransportMessage

use shuffle_api::{config::Config, transport::*, *};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

mod channel_handler;
pub use channel_handler::{ChannelClient, TransportChannelHandler};
use channel_handler::*;

mod client_factory;
pub use client_factory::TransportClientFactory;

mod codec;
use codec::*;

mod idle;
use idle::IdleStateMonitor;

mod server;
pub use server::TransportServer;

/// Transport configuration types.
pub mod config {
    /// Configuration parameters for the transport and for retrying fetches
    /// made over it.
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct TransportConfig {
        /// How many times a fetch that failed with an I/O error is retried.
        /// Default: 3.
        pub io_max_retries: u32,
        /// How long to wait before each retry, in milliseconds.
        /// Default: 5000 ms.
        pub io_retry_wait_ms: u32,
        /// Connect timeout and idle timeout of connections, in milliseconds.
        /// Default: 120000 ms.
        pub connection_timeout_ms: u32,
        /// Maximum size of a single frame, including its length prefix.
        /// Default: 16 MiB.
        pub max_frame_bytes: u32,
    }

    impl Default for TransportConfig {
        fn default() -> Self {
            Self {
                io_max_retries: 3,
                io_retry_wait_ms: 5000,
                connection_timeout_ms: 120_000,
                max_frame_bytes: 16 * 1024 * 1024,
            }
        }
    }

    /// Module-level configuration for the transport.
    #[derive(
        Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize,
    )]
    #[serde(default, rename_all = "camelCase")]
    pub struct TransportModConfig {
        /// Transport configuration.
        pub transport: TransportConfig,
    }
}

pub use config::*;

impl TransportConfig {
    /// Load the transport configuration out of a shared [Config].
    pub fn from_config(config: &Config) -> ShuffleResult<Self> {
        let config: TransportModConfig = config.get_module_config()?;
        Ok(config.transport)
    }

    /// The retry wait as a duration.
    pub fn io_retry_wait(&self) -> Duration {
        Duration::from_millis(self.io_retry_wait_ms as u64)
    }

    /// The connection timeout as a duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms as u64)
    }

    fn validate(&self) -> ShuffleResult<()> {
        if self.connection_timeout_ms == 0 {
            return Err(ShuffleError::other(
                "connectionTimeoutMs must be greater than zero",
            ));
        }
        if self.max_frame_bytes <= 4 {
            return Err(ShuffleError::other(
                "maxFrameBytes must leave room for the length prefix",
            ));
        }
        Ok(())
    }
}

/// Creates transport clients and servers, and sets up the pipeline of every
/// connection they open.
#[derive(Debug, Clone)]
pub struct TransportContext {
    config: Arc<TransportConfig>,
    rpc_handler: DynRpcHandler,
    close_idle_connections: bool,
    encoder: MessageEncoder,
    decoder: MessageDecoder,
}

impl TransportContext {
    /// Construct a context that keeps idle connections open.
    pub fn new(config: TransportConfig, rpc_handler: DynRpcHandler) -> Self {
        Self::with_close_idle_connections(config, rpc_handler, false)
    }

    /// Construct a context, choosing whether connections without
    /// outstanding requests are closed once idle.
    pub fn with_close_idle_connections(
        config: TransportConfig,
        rpc_handler: DynRpcHandler,
        close_idle_connections: bool,
    ) -> Self {
        Self {
            config: Arc::new(config),
            rpc_handler,
            close_idle_connections,
            encoder: MessageEncoder,
            decoder: MessageDecoder,
        }
    }

    /// The transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Create a client factory. `bootstraps` run in order on every new
    /// client connection, and must all succeed before a client is returned.
    pub fn create_client_factory(
        &self,
        bootstraps: Vec<DynTransportClientBootstrap>,
    ) -> TransportClientFactory {
        TransportClientFactory::new(self.clone(), bootstraps)
    }

    /// Create a server bound to `host:port`. Binds all interfaces if `host`
    /// is `None`, and an ephemeral port if `port` is zero.
    pub async fn create_server(
        &self,
        host: Option<&str>,
        port: u16,
        bootstraps: Vec<DynTransportServerBootstrap>,
    ) -> ShuffleResult<TransportServer> {
        TransportServer::bind(
            self.clone(),
            host.unwrap_or("0.0.0.0"),
            port,
            bootstraps,
        )
        .await
    }

    /// Create a server bound to any available ephemeral port on the
    /// loopback interface.
    pub async fn create_server_ephemeral(
        &self,
        bootstraps: Vec<DynTransportServerBootstrap>,
    ) -> ShuffleResult<TransportServer> {
        TransportServer::bind(self.clone(), "127.0.0.1", 0, bootstraps).await
    }

    /// Install the connection pipeline on `io` using the rpc handler of
    /// this context.
    pub fn initialize_pipeline<IO>(
        &self,
        io: IO,
        remote: SocketAddr,
    ) -> ShuffleResult<TransportChannelHandler>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.initialize_pipeline_with_handler(
            io,
            remote,
            self.rpc_handler.clone(),
        )
    }

    /// Install the connection pipeline on `io` and start processing it.
    ///
    /// Returns the channel handler, which includes the client that all
    /// users of this connection share. The pipeline is either fully
    /// installed or not at all; on error `io` is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn initialize_pipeline_with_handler<IO>(
        &self,
        io: IO,
        remote: SocketAddr,
        rpc_handler: DynRpcHandler,
    ) -> ShuffleResult<TransportChannelHandler>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if let Err(err) = self.config.validate() {
            tracing::error!(?err, %remote, "error while initializing pipeline");
            return Err(err);
        }

        let codec = TransportCodec::new(
            self.encoder,
            create_frame_decoder(self.config.max_frame_bytes as usize - 4),
            self.decoder,
        );
        let framed = Framed::new(io, codec);

        let handler = spawn_channel_handler(
            framed,
            ChannelConfig {
                remote,
                idle: IdleStateMonitor::new(self.config.connection_timeout()),
                close_idle_connections: self.close_idle_connections,
            },
            rpc_handler,
        );

        tracing::trace!(%remote, "pipeline initialized");

        Ok(handler)
    }

    pub(crate) fn rpc_handler(&self) -> DynRpcHandler {
        self.rpc_handler.clone()
    }
}

#[cfg(test)]
mod test;
