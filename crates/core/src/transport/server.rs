use super::*;
use std::sync::Mutex;
use tokio::{net::TcpListener, task::AbortHandle};

type Connections = Arc<Mutex<Vec<Arc<ChannelClient>>>>;

/// Accepts connections and serves them with the rpc handler of the
/// [TransportContext] it was created from.
///
/// Dropping the server stops accepting and closes every accepted
/// connection.
#[derive(Debug)]
pub struct TransportServer {
    local_addr: SocketAddr,
    connections: Connections,
    accept_task: AbortHandle,
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        for client in self.connections.lock().unwrap().drain(..) {
            client.close();
        }
    }
}

impl TransportServer {
    pub(super) async fn bind(
        context: TransportContext,
        host: &str,
        port: u16,
        bootstraps: Vec<DynTransportServerBootstrap>,
    ) -> ShuffleResult<Self> {
        let listener =
            TcpListener::bind((host, port)).await.map_err(|err| {
                ShuffleError::other_src(
                    format!("failed to bind {host}:{port}"),
                    err,
                )
            })?;
        let local_addr = listener.local_addr()?;
        let connections: Connections = Arc::new(Mutex::new(Vec::new()));

        let accept_task = tokio::task::spawn(accept_task(
            listener,
            context,
            bootstraps,
            connections.clone(),
        ))
        .abort_handle();

        tracing::info!(%local_addr, "transport server listening");

        Ok(Self {
            local_addr,
            connections,
            accept_task,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Clients of the connections accepted so far that are still open.
    pub fn connections(&self) -> Vec<Arc<ChannelClient>> {
        let mut lock = self.connections.lock().unwrap();
        lock.retain(|c| c.is_active());
        lock.clone()
    }
}

async fn accept_task(
    listener: TcpListener,
    context: TransportContext,
    bootstraps: Vec<DynTransportServerBootstrap>,
    connections: Connections,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(?err, "failed to accept connection");
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(?err, %peer, "could not set TCP_NODELAY");
        }

        let rpc_handler = bootstraps
            .iter()
            .fold(context.rpc_handler(), |handler, bootstrap| {
                bootstrap.do_bootstrap(peer, handler)
            });

        match context
            .initialize_pipeline_with_handler(stream, peer, rpc_handler)
        {
            Ok(handler) => {
                tracing::debug!(%peer, "accepted connection");
                let mut lock = connections.lock().unwrap();
                lock.retain(|c| c.is_active());
                lock.push(handler.client());
            }
            Err(err) => {
                tracing::warn!(?err, %peer, "dropping connection");
            }
        }
    }
}
