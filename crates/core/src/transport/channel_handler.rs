//! The last stage of every connection pipeline.
//!
//! A [TransportChannelHandler] multiplexes many logical requests over one
//! connection. It owns the [ChannelClient] used to send on the connection,
//! correlates incoming responses with outstanding requests, and dispatches
//! incoming requests to the application [RpcHandler].

use super::{codec::TransportCodec, idle::IdleStateMonitor};
use futures::{SinkExt, StreamExt};
use shuffle_api::{protocol::*, transport::*, *};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot, watch},
    task::JoinSet,
};
use tokio_util::{codec::Framed, sync::CancellationToken};

type ResponseSender = oneshot::Sender<ShuffleResult<bytes::Bytes>>;

fn connection_closed(remote: SocketAddr) -> ShuffleError {
    ShuffleError::other_src(
        format!("connection to {remote} closed"),
        std::io::Error::from(std::io::ErrorKind::ConnectionReset),
    )
}

#[derive(Debug, Default)]
struct ResponseState {
    outstanding: HashMap<u64, ResponseSender>,
    closed: bool,
}

/// Matches responses to outstanding requests.
#[derive(Debug, Default)]
pub(crate) struct ResponseHandler {
    state: Mutex<ResponseState>,
}

impl ResponseHandler {
    /// Returns the sender back if the connection is already closed.
    fn add(
        &self,
        request_id: u64,
        sender: ResponseSender,
    ) -> Result<(), ResponseSender> {
        let mut lock = self.state.lock().unwrap();
        if lock.closed {
            return Err(sender);
        }
        lock.outstanding.insert(request_id, sender);
        Ok(())
    }

    fn remove(&self, request_id: u64) {
        self.state.lock().unwrap().outstanding.remove(&request_id);
    }

    pub fn num_outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding.len()
    }

    fn handle(&self, remote: SocketAddr, msg: TransportMessage) {
        let sender = self
            .state
            .lock()
            .unwrap()
            .outstanding
            .remove(&msg.request_id);
        let Some(sender) = sender else {
            tracing::warn!(
                %remote,
                request_id = msg.request_id,
                "ignoring response for unknown request, it may have timed out"
            );
            return;
        };
        let result = match msg.ty() {
            Ty::Response => Ok(msg.body),
            _ => Err(ShuffleError::other(format!(
                "remote {remote} failed request: {}",
                String::from_utf8_lossy(&msg.body)
            ))),
        };
        // the requester may have given up waiting
        let _ = sender.send(result);
    }

    fn fail(&self, request_id: u64, err: ShuffleError) {
        let sender = self
            .state
            .lock()
            .unwrap()
            .outstanding
            .remove(&request_id);
        if let Some(sender) = sender {
            let _ = sender.send(Err(err));
        }
    }

    fn fail_all(&self, err: ShuffleError) {
        let outstanding = {
            let mut lock = self.state.lock().unwrap();
            lock.closed = true;
            std::mem::take(&mut lock.outstanding)
        };
        for (_, sender) in outstanding {
            let _ = sender.send(Err(err.clone()));
        }
    }
}

/// The client handle bound to one connection.
///
/// Both ends of a connection have one. All requests on the connection,
/// whichever logical caller issues them, share this handle.
#[derive(Debug)]
pub struct ChannelClient {
    remote: SocketAddr,
    next_request_id: AtomicU64,
    outbound: mpsc::UnboundedSender<TransportMessage>,
    responses: Arc<ResponseHandler>,
    state: watch::Receiver<ConnectionState>,
    close_token: CancellationToken,
}

impl ChannelClient {
    /// Watch the connection state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Number of requests sent on this connection still waiting for
    /// a response.
    pub fn num_outstanding_requests(&self) -> usize {
        self.responses.num_outstanding()
    }
}

impl TransportClient for ChannelClient {
    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn is_active(&self) -> bool {
        *self.state.borrow() != ConnectionState::Closed
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn send_rpc(
        &self,
        message: bytes::Bytes,
    ) -> BoxFut<'_, ShuffleResult<bytes::Bytes>> {
        Box::pin(async move {
            let request_id =
                self.next_request_id.fetch_add(1, Ordering::Relaxed);
            let (s, r) = oneshot::channel();
            if self.responses.add(request_id, s).is_err() {
                return Err(connection_closed(self.remote));
            }
            if self
                .outbound
                .send(TransportMessage::request(request_id, message))
                .is_err()
            {
                self.responses.remove(request_id);
                return Err(connection_closed(self.remote));
            }
            match r.await {
                Ok(r) => r,
                Err(_) => Err(connection_closed(self.remote)),
            }
        })
    }

    fn send_one_way(
        &self,
        message: bytes::Bytes,
    ) -> BoxFut<'_, ShuffleResult<()>> {
        Box::pin(async move {
            if !self.is_active() {
                return Err(connection_closed(self.remote));
            }
            self.outbound
                .send(TransportMessage::one_way(message))
                .map_err(|_| connection_closed(self.remote))
        })
    }

    fn close(&self) {
        self.close_token.cancel();
    }
}

/// The multiplexer stage of a connection pipeline.
///
/// The connection closes on [TransportChannelHandler::close] or
/// [TransportClient::close], or once the handler and every client handle
/// of the connection are dropped.
#[derive(Debug)]
pub struct TransportChannelHandler {
    client: Arc<ChannelClient>,
}

impl TransportChannelHandler {
    /// The client bound to this connection.
    pub fn client(&self) -> Arc<ChannelClient> {
        self.client.clone()
    }

    /// Close the connection.
    pub fn close(&self) {
        self.client.close();
    }
}

pub(crate) struct ChannelConfig {
    pub remote: SocketAddr,
    pub idle: IdleStateMonitor,
    pub close_idle_connections: bool,
}

/// Take ownership of the framed connection and start processing it.
/// Must be called from within a tokio runtime.
pub(crate) fn spawn_channel_handler<IO>(
    framed: Framed<IO, TransportCodec>,
    config: ChannelConfig,
    rpc_handler: DynRpcHandler,
) -> TransportChannelHandler
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (state_tx, state_rx) =
        watch::channel(ConnectionState::PipelineInstalled);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let responses = Arc::new(ResponseHandler::default());

    let client = Arc::new(ChannelClient {
        remote: config.remote,
        next_request_id: AtomicU64::new(1),
        outbound: outbound_tx,
        responses: responses.clone(),
        state: state_rx,
        close_token: CancellationToken::new(),
    });

    tokio::task::spawn(connection_task(
        framed,
        outbound_rx,
        Arc::downgrade(&client),
        client.close_token.clone(),
        responses,
        rpc_handler,
        state_tx,
        config,
    ));

    TransportChannelHandler { client }
}

enum CloseReason {
    Local,
    Dropped,
    RemoteEof,
    Idle,
    IdleWithOutstanding(usize),
    Error(ShuffleError),
}

impl CloseReason {
    fn into_error(self, remote: SocketAddr) -> ShuffleError {
        match self {
            CloseReason::IdleWithOutstanding(count) => ShuffleError::other_src(
                format!(
                    "connection to {remote} timed out with {count} \
                    outstanding requests"
                ),
                std::io::Error::from(std::io::ErrorKind::TimedOut),
            ),
            CloseReason::Error(err) => ShuffleError::other_src(
                format!("connection to {remote} failed: {err}"),
                std::io::Error::from(std::io::ErrorKind::ConnectionReset),
            ),
            _ => connection_closed(remote),
        }
    }
}

type SharedIdle = Arc<Mutex<IdleStateMonitor>>;
type StateSender = Arc<watch::Sender<ConnectionState>>;

fn set_active(state_tx: &watch::Sender<ConnectionState>) {
    state_tx.send_if_modified(|s| {
        if *s == ConnectionState::Idle {
            *s = ConnectionState::Active;
            true
        } else {
            false
        }
    });
}

/// Reads inbound messages and watches the idle deadline. Writing happens
/// on a separate [write_task] so that a slow write never stops reads.
async fn connection_task<IO>(
    framed: Framed<IO, TransportCodec>,
    outbound_rx: mpsc::UnboundedReceiver<TransportMessage>,
    client: Weak<ChannelClient>,
    close_token: CancellationToken,
    responses: Arc<ResponseHandler>,
    rpc_handler: DynRpcHandler,
    state_tx: watch::Sender<ConnectionState>,
    config: ChannelConfig,
) where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let ChannelConfig {
        remote,
        idle,
        close_idle_connections,
    } = config;
    let idle_timeout = idle.timeout();
    let idle: SharedIdle = Arc::new(Mutex::new(idle));
    let state_tx: StateSender = Arc::new(state_tx);
    let (sink, mut stream) = framed.split();
    let mut request_tasks = JoinSet::new();

    let stop_writer = CancellationToken::new();
    let mut writer = tokio::task::spawn(write_task(
        sink,
        outbound_rx,
        responses.clone(),
        idle.clone(),
        state_tx.clone(),
        remote,
        stop_writer.clone(),
    ));
    let mut writer_done = false;

    state_tx.send_replace(ConnectionState::Active);
    if let Some(client) = client.upgrade() {
        rpc_handler.channel_active(client);
    }

    let reason = loop {
        // reap finished request handlers
        while request_tasks.try_join_next().is_some() {}

        let deadline = idle.lock().unwrap().deadline();

        tokio::select! {
            _ = close_token.cancelled() => break CloseReason::Local,
            res = &mut writer => {
                writer_done = true;
                break match res {
                    Ok(reason) => reason,
                    Err(err) => CloseReason::Error(ShuffleError::other_src(
                        "connection writer failed",
                        err,
                    )),
                };
            }
            msg = stream.next() => match msg {
                Some(Ok(msg)) => {
                    idle.lock().unwrap().touch_read();
                    set_active(&state_tx);
                    dispatch(
                        msg,
                        remote,
                        &client,
                        &responses,
                        &rpc_handler,
                        &mut request_tasks,
                    );
                }
                Some(Err(err)) => break CloseReason::Error(err),
                None => break CloseReason::RemoteEof,
            },
            _ = tokio::time::sleep_until(deadline) => {
                {
                    let mut idle = idle.lock().unwrap();
                    // the writer may have been active since
                    if tokio::time::Instant::now() < idle.deadline() {
                        continue;
                    }
                    idle.mark_idle_event();
                }
                state_tx.send_replace(ConnectionState::Idle);
                let outstanding = responses.num_outstanding();
                if outstanding > 0 {
                    tracing::error!(
                        %remote,
                        outstanding,
                        "connection idle with outstanding requests, \
                        assuming it is dead"
                    );
                    break CloseReason::IdleWithOutstanding(outstanding);
                } else if close_idle_connections {
                    tracing::debug!(%remote, "closing idle connection");
                    break CloseReason::Idle;
                }
            }
        }
    };

    match &reason {
        CloseReason::Error(err) => {
            tracing::warn!(?err, %remote, "connection failed");
        }
        CloseReason::RemoteEof => {
            tracing::debug!(%remote, "connection closed by remote");
        }
        CloseReason::Dropped => {
            tracing::debug!(%remote, "all client handles dropped");
        }
        _ => (),
    }

    state_tx.send_replace(ConnectionState::Closed);
    request_tasks.abort_all();
    responses.fail_all(reason.into_error(remote));
    if let Some(client) = client.upgrade() {
        rpc_handler.channel_inactive(client);
    }

    if !writer_done {
        stop_writer.cancel();
        // a write blocked on an unresponsive peer must not keep the
        // connection open
        if tokio::time::timeout(idle_timeout, &mut writer).await.is_err() {
            tracing::debug!(%remote, "aborting stuck connection writer");
            writer.abort();
        }
    }
}

/// Drains outbound messages into the connection. Returns when all client
/// handles are dropped, when stopped, or on a write error.
async fn write_task<S>(
    mut sink: S,
    mut outbound_rx: mpsc::UnboundedReceiver<TransportMessage>,
    responses: Arc<ResponseHandler>,
    idle: SharedIdle,
    state_tx: StateSender,
    remote: SocketAddr,
    stop: CancellationToken,
) -> CloseReason
where
    S: futures::Sink<TransportMessage, Error = ShuffleError> + Unpin,
{
    let reason = loop {
        let msg = tokio::select! {
            _ = stop.cancelled() => break CloseReason::Local,
            msg = outbound_rx.recv() => match msg {
                Some(msg) => msg,
                None => break CloseReason::Dropped,
            },
        };

        let (ty, request_id) = (msg.ty(), msg.request_id);
        match sink.send(msg).await {
            Ok(()) => {
                idle.lock().unwrap().touch_write();
                set_active(&state_tx);
            }
            // rejected by the codec, nothing was written
            Err(err) if !err.is_transient() => {
                tracing::warn!(
                    ?err,
                    %remote,
                    request_id,
                    "outbound message rejected"
                );
                match ty {
                    Ty::Request => responses.fail(request_id, err),
                    Ty::Response => {
                        let reply = TransportMessage::failure(request_id, &err);
                        if let Err(err) = sink.send(reply).await {
                            break CloseReason::Error(err);
                        }
                    }
                    _ => (),
                }
            }
            Err(err) => break CloseReason::Error(err),
        }
    };

    if let Err(err) = sink.close().await {
        tracing::debug!(?err, %remote, "error shutting down connection");
    }

    reason
}

fn dispatch(
    msg: TransportMessage,
    remote: SocketAddr,
    client: &Weak<ChannelClient>,
    responses: &ResponseHandler,
    rpc_handler: &DynRpcHandler,
    request_tasks: &mut JoinSet<()>,
) {
    let ty = msg.ty();
    let client = match ty {
        Ty::Response | Ty::Failure => {
            responses.handle(remote, msg);
            return;
        }
        Ty::Unspecified => {
            tracing::debug!(%remote, "ignoring message of unknown type");
            return;
        }
        Ty::Request | Ty::OneWay => match client.upgrade() {
            Some(client) => client,
            None => {
                tracing::debug!(
                    %remote,
                    "all client handles dropped, ignoring message"
                );
                return;
            }
        },
    };
    if ty == Ty::OneWay {
        rpc_handler.receive_one_way(client, msg.body);
        return;
    }

    let rpc_handler = rpc_handler.clone();
    request_tasks.spawn(async move {
        let request_id = msg.request_id;
        let reply = match rpc_handler.receive(client.clone(), msg.body).await {
            Ok(body) => TransportMessage::response(request_id, body),
            Err(err) => {
                tracing::debug!(
                    ?err,
                    %remote,
                    request_id,
                    "rpc handler failed request"
                );
                TransportMessage::failure(request_id, &err)
            }
        };
        if client.outbound.send(reply).is_err() {
            tracing::debug!(
                %remote,
                request_id,
                "connection closed before reply could be sent"
            );
        }
    });
}
