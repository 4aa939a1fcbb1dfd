use super::*;
use tokio::net::TcpStream;

/// Opens client connections to transport servers.
///
/// Every call opens a new connection. Callers that want to share a
/// connection should share the returned client, it supports any number of
/// concurrent requests.
#[derive(Debug, Clone)]
pub struct TransportClientFactory {
    context: TransportContext,
    bootstraps: Arc<Vec<DynTransportClientBootstrap>>,
}

impl TransportClientFactory {
    pub(super) fn new(
        context: TransportContext,
        bootstraps: Vec<DynTransportClientBootstrap>,
    ) -> Self {
        Self {
            context,
            bootstraps: Arc::new(bootstraps),
        }
    }

    /// Connect to `addr`, install the pipeline and run the client
    /// bootstraps. Connection failures, including a connect timeout,
    /// are reported as I/O errors.
    pub async fn create_client(
        &self,
        addr: SocketAddr,
    ) -> ShuffleResult<Arc<ChannelClient>> {
        let timeout = self.context.config().connection_timeout();
        let stream =
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    return Err(ShuffleError::other_src(
                        format!("failed to connect to {addr}"),
                        err,
                    ))
                }
                Err(_) => {
                    return Err(ShuffleError::other_src(
                        format!(
                            "connecting to {addr} timed out after {timeout:?}"
                        ),
                        std::io::Error::from(std::io::ErrorKind::TimedOut),
                    ))
                }
            };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(?err, %addr, "could not set TCP_NODELAY");
        }

        let handler = self.context.initialize_pipeline(stream, addr)?;
        let client = handler.client();

        for bootstrap in self.bootstraps.iter() {
            if let Err(err) = bootstrap.do_bootstrap(client.clone()).await {
                tracing::error!(?err, %addr, "client bootstrap failed");
                client.close();
                return Err(err);
            }
        }

        tracing::debug!(%addr, "connection established");

        Ok(client)
    }
}
