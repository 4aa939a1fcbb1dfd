//! Transport related types.
//!
//! A transport connection carries many concurrent logical requests. Both
//! ends of a connection get a [TransportClient] handle; on the server side
//! it is handed to the [RpcHandler] so that the server may push messages
//! back over the same connection.

use crate::*;
use std::{net::SocketAddr, sync::Arc};

/// The lifecycle of a transport connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// The channel stages are installed but the connection task has not
    /// started processing yet.
    PipelineInstalled,
    /// Data was read or written within the idle timeout.
    Active,
    /// Nothing was read or written for at least the idle timeout.
    Idle,
    /// The connection is closed and every handle on it is unusable.
    Closed,
}

/// A handle for sending messages over one transport connection.
pub trait TransportClient: 'static + Send + Sync + std::fmt::Debug {
    /// The address of the remote end.
    fn remote_address(&self) -> SocketAddr;

    /// Returns true until the connection is closed.
    fn is_active(&self) -> bool;

    /// The current connection state.
    fn state(&self) -> ConnectionState;

    /// Send a request and wait for its response.
    ///
    /// Connection loss resolves with an error wrapping an
    /// [std::io::Error]. A failure reported by the remote handler resolves
    /// with an error that does not.
    fn send_rpc(
        &self,
        message: bytes::Bytes,
    ) -> BoxFut<'_, ShuffleResult<bytes::Bytes>>;

    /// Send a message that expects no response. Resolves once the message
    /// is handed to the connection, not when it is received.
    fn send_one_way(
        &self,
        message: bytes::Bytes,
    ) -> BoxFut<'_, ShuffleResult<()>>;

    /// Close the connection. Outstanding requests fail.
    fn close(&self);
}

/// Trait-object [TransportClient].
pub type DynTransportClient = Arc<dyn TransportClient>;

/// Application-level handler for messages arriving on a connection.
pub trait RpcHandler: 'static + Send + Sync + std::fmt::Debug {
    /// Handle a request. The result is sent back to the requester as a
    /// response or failure. `client` is the handle of the connection the
    /// request arrived on.
    fn receive(
        &self,
        client: DynTransportClient,
        message: bytes::Bytes,
    ) -> BoxFut<'_, ShuffleResult<bytes::Bytes>>;

    /// Handle a one-way message.
    ///
    /// The default implementation drops the message.
    fn receive_one_way(
        &self,
        client: DynTransportClient,
        message: bytes::Bytes,
    ) {
        drop((client, message));
    }

    /// A connection using this handler has become active.
    fn channel_active(&self, client: DynTransportClient) {
        drop(client);
    }

    /// A connection using this handler was closed.
    fn channel_inactive(&self, client: DynTransportClient) {
        drop(client);
    }
}

/// Trait-object [RpcHandler].
pub type DynRpcHandler = Arc<dyn RpcHandler>;

/// A handler that rejects every request. Useful on the client side of
/// a connection where the remote is not expected to send requests.
#[derive(Debug)]
pub struct NoOpRpcHandler;

impl RpcHandler for NoOpRpcHandler {
    fn receive(
        &self,
        _client: DynTransportClient,
        _message: bytes::Bytes,
    ) -> BoxFut<'_, ShuffleResult<bytes::Bytes>> {
        Box::pin(async move {
            Err(ShuffleError::other("this endpoint does not accept requests"))
        })
    }
}

/// A step run on every new client connection before the client is
/// handed out, e.g. authentication. Steps run in order and all of them
/// must succeed.
pub trait TransportClientBootstrap: 'static + Send + Sync + std::fmt::Debug {
    /// Perform the bootstrap on a freshly connected client.
    fn do_bootstrap(
        &self,
        client: DynTransportClient,
    ) -> BoxFut<'_, ShuffleResult<()>>;
}

/// Trait-object [TransportClientBootstrap].
pub type DynTransportClientBootstrap = Arc<dyn TransportClientBootstrap>;

/// A step run on every accepted server connection. It may wrap the
/// rpc handler, for example to require authentication before requests
/// reach the application.
pub trait TransportServerBootstrap: 'static + Send + Sync + std::fmt::Debug {
    /// Return the handler to use for the connection from `peer`.
    fn do_bootstrap(
        &self,
        peer: SocketAddr,
        rpc_handler: DynRpcHandler,
    ) -> DynRpcHandler;
}

/// Trait-object [TransportServerBootstrap].
pub type DynTransportServerBootstrap = Arc<dyn TransportServerBootstrap>;
