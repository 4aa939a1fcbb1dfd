use super::*;
use shuffle_test_utils::{enable_tracing, iter_check, rpc::MemBlockRpcHandler};
use std::sync::Mutex;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn blocks() -> MemBlockRpcHandler {
    MemBlockRpcHandler::new([
        (BlockId::from("a"), bytes::Bytes::from_static(b"data-a")),
        (BlockId::from("b"), bytes::Bytes::from_static(b"data-b")),
    ])
}

/// Connect two contexts over an in-memory stream. Returns the client side
/// handler first.
fn connect(
    client_ctx: &TransportContext,
    server_ctx: &TransportContext,
) -> (TransportChannelHandler, TransportChannelHandler) {
    let (c, s) = tokio::io::duplex(64 * 1024);
    let client = client_ctx.initialize_pipeline(c, addr(2)).unwrap();
    let server = server_ctx.initialize_pipeline(s, addr(1)).unwrap();
    (client, server)
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Active,
    OneWay(bytes::Bytes),
    Inactive,
}

#[derive(Debug, Default)]
struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl RpcHandler for RecordingHandler {
    fn receive(
        &self,
        client: DynTransportClient,
        message: bytes::Bytes,
    ) -> BoxFut<'_, ShuffleResult<bytes::Bytes>> {
        Box::pin(async move {
            // answer, and also push the same bytes back unprompted
            client.send_one_way(message.clone()).await?;
            Ok(message)
        })
    }

    fn receive_one_way(
        &self,
        _client: DynTransportClient,
        message: bytes::Bytes,
    ) {
        self.events.lock().unwrap().push(Event::OneWay(message));
    }

    fn channel_active(&self, _client: DynTransportClient) {
        self.events.lock().unwrap().push(Event::Active);
    }

    fn channel_inactive(&self, _client: DynTransportClient) {
        self.events.lock().unwrap().push(Event::Inactive);
    }
}

#[derive(Debug)]
struct EchoHandler;

impl RpcHandler for EchoHandler {
    fn receive(
        &self,
        _client: DynTransportClient,
        message: bytes::Bytes,
    ) -> BoxFut<'_, ShuffleResult<bytes::Bytes>> {
        Box::pin(async move { Ok(message) })
    }
}

#[derive(Debug)]
struct HangingHandler;

impl RpcHandler for HangingHandler {
    fn receive(
        &self,
        _client: DynTransportClient,
        _message: bytes::Bytes,
    ) -> BoxFut<'_, ShuffleResult<bytes::Bytes>> {
        Box::pin(std::future::pending())
    }
}

fn ctx(handler: DynRpcHandler) -> TransportContext {
    TransportContext::new(TransportConfig::default(), handler)
}

fn ctx_with_timeout(
    handler: DynRpcHandler,
    connection_timeout_ms: u32,
    close_idle_connections: bool,
) -> TransportContext {
    TransportContext::with_close_idle_connections(
        TransportConfig {
            connection_timeout_ms,
            ..Default::default()
        },
        handler,
        close_idle_connections,
    )
}

#[tokio::test]
async fn rpc_round_trip() {
    enable_tracing();

    let (client, _server) =
        connect(&ctx(Arc::new(NoOpRpcHandler)), &ctx(Arc::new(blocks())));
    let client = client.client();

    let (a, b) = futures::join!(
        client.send_rpc(BlockId::from("a").to_bytes()),
        client.send_rpc(BlockId::from("b").to_bytes()),
    );
    assert_eq!(b"data-a", &a.unwrap()[..]);
    assert_eq!(b"data-b", &b.unwrap()[..]);
    assert_eq!(0, client.num_outstanding_requests());
    assert_eq!(addr(2), client.remote_address());
}

#[tokio::test]
async fn remote_failure_is_not_transient() {
    enable_tracing();

    let (client, _server) =
        connect(&ctx(Arc::new(NoOpRpcHandler)), &ctx(Arc::new(blocks())));
    let client = client.client();

    let err = client
        .send_rpc(BlockId::from("missing").to_bytes())
        .await
        .unwrap_err();
    assert!(!err.is_transient());
    assert!(err.to_string().contains("block missing not found"), "{err}");

    // the connection survives a failed request
    assert!(client.is_active());
    client
        .send_rpc(BlockId::from("a").to_bytes())
        .await
        .unwrap();
}

#[tokio::test]
async fn connection_loss_is_transient() {
    enable_tracing();

    let handler =
        blocks().with_dropped_connection_once(BlockId::from("a"));
    let (client, _server) =
        connect(&ctx(Arc::new(NoOpRpcHandler)), &ctx(Arc::new(handler)));
    let client = client.client();

    let err = client
        .send_rpc(BlockId::from("a").to_bytes())
        .await
        .unwrap_err();
    assert!(err.is_transient(), "{err}");

    iter_check!(1000, {
        if !client.is_active() {
            break;
        }
    });
    assert_eq!(ConnectionState::Closed, client.state());

    let err = client
        .send_rpc(BlockId::from("b").to_bytes())
        .await
        .unwrap_err();
    assert!(err.is_transient(), "{err}");
    assert!(client
        .send_one_way(bytes::Bytes::from_static(b"x"))
        .await
        .unwrap_err()
        .is_transient());
}

#[tokio::test]
async fn server_pushes_over_the_requesting_client() {
    enable_tracing();

    let client_handler = Arc::new(RecordingHandler::default());
    let server_handler = Arc::new(RecordingHandler::default());
    let (client, _server) =
        connect(&ctx(client_handler.clone()), &ctx(server_handler.clone()));
    let client = client.client();

    let res = client
        .send_rpc(bytes::Bytes::from_static(b"hello"))
        .await
        .unwrap();
    assert_eq!(b"hello", &res[..]);

    iter_check!(1000, {
        if client_handler
            .events()
            .contains(&Event::OneWay(bytes::Bytes::from_static(b"hello")))
        {
            break;
        }
    });
    assert_eq!(vec![Event::Active], server_handler.events());
}

#[tokio::test]
async fn lifecycle_hooks_fire_on_both_ends() {
    enable_tracing();

    let client_handler = Arc::new(RecordingHandler::default());
    let server_handler = Arc::new(RecordingHandler::default());
    let (client, server) =
        connect(&ctx(client_handler.clone()), &ctx(server_handler.clone()));

    iter_check!(1000, {
        if client.client().state() == ConnectionState::Active
            && server.client().state() == ConnectionState::Active
        {
            break;
        }
    });

    client.close();

    iter_check!(1000, {
        if client_handler.events().contains(&Event::Inactive)
            && server_handler.events().contains(&Event::Inactive)
        {
            break;
        }
    });
    assert_eq!(vec![Event::Active, Event::Inactive], client_handler.events());
    assert_eq!(vec![Event::Active, Event::Inactive], server_handler.events());
    assert!(!server.client().is_active());
}

#[tokio::test]
async fn large_concurrent_rpcs_in_both_directions() {
    enable_tracing();

    let (client, server) =
        connect(&ctx(Arc::new(EchoHandler)), &ctx(Arc::new(EchoHandler)));
    let client = client.client();
    let server = server.client();

    // both ends write frames far larger than the in-memory pipe buffer
    let rpcs = (0..8u8).flat_map(|i| {
        let from_client = bytes::Bytes::from(vec![i; 1024 * 1024]);
        let from_server = bytes::Bytes::from(vec![i + 100; 1024 * 1024]);
        [
            (client.clone(), from_client),
            (server.clone(), from_server),
        ]
    });
    let results = tokio::time::timeout(
        std::time::Duration::from_secs(20),
        futures::future::join_all(rpcs.map(|(c, body)| async move {
            let res = c.send_rpc(body.clone()).await;
            (body, res)
        })),
    )
    .await
    .expect("large concurrent rpcs stalled");

    assert_eq!(16, results.len());
    for (body, res) in results {
        assert_eq!(body, res.unwrap());
    }
    assert!(client.is_active());
    assert!(server.is_active());
}

#[tokio::test]
async fn dropping_every_handle_closes_the_connection() {
    enable_tracing();

    let (client, server) =
        connect(&ctx(Arc::new(NoOpRpcHandler)), &ctx(Arc::new(blocks())));
    let client_state = client.client().subscribe_state();

    let res = client
        .client()
        .send_rpc(BlockId::from("a").to_bytes())
        .await
        .unwrap();
    assert_eq!(b"data-a", &res[..]);

    drop(client);

    iter_check!(1000, {
        if server.client().state() == ConnectionState::Closed
            && *client_state.borrow() == ConnectionState::Closed
        {
            break;
        }
    });
}

#[tokio::test(start_paused = true)]
async fn idle_connection_is_closed_when_enabled() {
    enable_tracing();

    let (client, server) = connect(
        &ctx_with_timeout(Arc::new(NoOpRpcHandler), 1000, true),
        &ctx_with_timeout(Arc::new(blocks()), 60_000, false),
    );
    let client = client.client();
    client
        .send_rpc(BlockId::from("a").to_bytes())
        .await
        .unwrap();
    assert!(client.is_active());

    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    assert_eq!(ConnectionState::Closed, client.state());
    iter_check!(1000, {
        if !server.client().is_active() {
            break;
        }
    });
}

#[tokio::test(start_paused = true)]
async fn idle_connection_stays_open_when_disabled() {
    enable_tracing();

    let (client, _server) = connect(
        &ctx_with_timeout(Arc::new(NoOpRpcHandler), 1000, false),
        &ctx_with_timeout(Arc::new(blocks()), 60_000, false),
    );
    let client = client.client();

    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    assert_eq!(ConnectionState::Idle, client.state());
    assert!(client.is_active());

    let res = client
        .send_rpc(BlockId::from("a").to_bytes())
        .await
        .unwrap();
    assert_eq!(b"data-a", &res[..]);
    assert_eq!(ConnectionState::Active, client.state());
}

#[tokio::test(start_paused = true)]
async fn idle_with_outstanding_requests_fails_them() {
    enable_tracing();

    let (client, _server) = connect(
        &ctx_with_timeout(Arc::new(NoOpRpcHandler), 1000, false),
        &ctx_with_timeout(Arc::new(HangingHandler), 60_000, false),
    );
    let client = client.client();

    let err = client
        .send_rpc(bytes::Bytes::from_static(b"never answered"))
        .await
        .unwrap_err();
    assert!(err.is_transient(), "{err}");
    assert!(err.to_string().contains("timed out"), "{err}");
    assert_eq!(ConnectionState::Closed, client.state());
}

#[tokio::test]
async fn oversized_inbound_frame_closes_the_connection() {
    enable_tracing();

    let server_ctx = TransportContext::new(
        TransportConfig {
            max_frame_bytes: 1024,
            ..Default::default()
        },
        Arc::new(blocks()),
    );
    let (client, server) = connect(&ctx(Arc::new(NoOpRpcHandler)), &server_ctx);
    let client = client.client();

    let err = client
        .send_rpc(bytes::Bytes::from(vec![0; 4096]))
        .await
        .unwrap_err();
    assert!(err.is_transient(), "{err}");
    assert!(!server.client().is_active());
}

#[tokio::test]
async fn oversized_outbound_request_fails_only_that_request() {
    enable_tracing();

    let client_ctx = TransportContext::new(
        TransportConfig {
            max_frame_bytes: 1024,
            ..Default::default()
        },
        Arc::new(NoOpRpcHandler),
    );
    let (client, _server) = connect(&client_ctx, &ctx(Arc::new(blocks())));
    let client = client.client();

    let err = client
        .send_rpc(bytes::Bytes::from(vec![0; 4096]))
        .await
        .unwrap_err();
    assert!(!err.is_transient(), "{err}");
    assert!(client.is_active());

    let res = client
        .send_rpc(BlockId::from("a").to_bytes())
        .await
        .unwrap();
    assert_eq!(b"data-a", &res[..]);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    for config in [
        TransportConfig {
            connection_timeout_ms: 0,
            ..Default::default()
        },
        TransportConfig {
            max_frame_bytes: 4,
            ..Default::default()
        },
    ] {
        let ctx = TransportContext::new(config, Arc::new(NoOpRpcHandler));
        let (io, _other) = tokio::io::duplex(1024);
        assert!(ctx.initialize_pipeline(io, addr(1)).is_err());
    }
}

#[test]
fn config_loads_from_module_config() {
    let config = Config::default();
    assert_eq!(
        TransportConfig::default(),
        TransportConfig::from_config(&config).unwrap()
    );

    config
        .set_module_config(&TransportModConfig {
            transport: TransportConfig {
                io_max_retries: 7,
                io_retry_wait_ms: 10,
                ..Default::default()
            },
        })
        .unwrap();
    let loaded = TransportConfig::from_config(&config).unwrap();
    assert_eq!(7, loaded.io_max_retries);
    assert_eq!(Duration::from_millis(10), loaded.io_retry_wait());
    assert_eq!(Duration::from_secs(120), loaded.connection_timeout());

    let partial: TransportModConfig =
        serde_json::from_str(r#"{"transport":{"maxFrameBytes":2048}}"#)
            .unwrap();
    assert_eq!(2048, partial.transport.max_frame_bytes);
    assert_eq!(3, partial.transport.io_max_retries);
}

#[derive(Debug)]
struct RecordOrder {
    name: &'static str,
    order: Arc<Mutex<Vec<&'static str>>>,
    fail: bool,
}

impl TransportClientBootstrap for RecordOrder {
    fn do_bootstrap(
        &self,
        client: DynTransportClient,
    ) -> BoxFut<'_, ShuffleResult<()>> {
        Box::pin(async move {
            assert!(client.is_active());
            self.order.lock().unwrap().push(self.name);
            if self.fail {
                Err(ShuffleError::other("bootstrap refused"))
            } else {
                Ok(())
            }
        })
    }
}

#[derive(Debug)]
struct CountRequests {
    inner: DynRpcHandler,
    requests: Arc<Mutex<usize>>,
}

impl RpcHandler for CountRequests {
    fn receive(
        &self,
        client: DynTransportClient,
        message: bytes::Bytes,
    ) -> BoxFut<'_, ShuffleResult<bytes::Bytes>> {
        *self.requests.lock().unwrap() += 1;
        self.inner.receive(client, message)
    }
}

#[derive(Debug, Default)]
struct CountingBootstrap {
    peers: Mutex<Vec<SocketAddr>>,
    requests: Arc<Mutex<usize>>,
}

impl TransportServerBootstrap for CountingBootstrap {
    fn do_bootstrap(
        &self,
        peer: SocketAddr,
        rpc_handler: DynRpcHandler,
    ) -> DynRpcHandler {
        self.peers.lock().unwrap().push(peer);
        Arc::new(CountRequests {
            inner: rpc_handler,
            requests: self.requests.clone(),
        })
    }
}

#[tokio::test]
async fn tcp_server_and_client_factory() {
    enable_tracing();

    let server_bootstrap = Arc::new(CountingBootstrap::default());
    let server = ctx(Arc::new(blocks()))
        .create_server_ephemeral(vec![server_bootstrap.clone()])
        .await
        .unwrap();
    assert_ne!(0, server.port());

    let order = Arc::new(Mutex::new(Vec::new()));
    let factory = ctx(Arc::new(NoOpRpcHandler)).create_client_factory(vec![
        Arc::new(RecordOrder {
            name: "first",
            order: order.clone(),
            fail: false,
        }),
        Arc::new(RecordOrder {
            name: "second",
            order: order.clone(),
            fail: false,
        }),
    ]);

    let client = factory.create_client(server.local_addr()).await.unwrap();
    assert_eq!(vec!["first", "second"], *order.lock().unwrap());

    let res = client
        .send_rpc(BlockId::from("b").to_bytes())
        .await
        .unwrap();
    assert_eq!(b"data-b", &res[..]);
    assert_eq!(1, *server_bootstrap.requests.lock().unwrap());
    assert_eq!(1, server_bootstrap.peers.lock().unwrap().len());
    assert_eq!(1, server.connections().len());

    // every call opens a new connection
    let second = factory.create_client(server.local_addr()).await.unwrap();
    second
        .send_rpc(BlockId::from("a").to_bytes())
        .await
        .unwrap();
    assert_eq!(2, server.connections().len());

    client.close();
    iter_check!(1000, {
        if server.connections().len() == 1 {
            break;
        }
    });
}

#[tokio::test]
async fn failed_client_bootstrap_closes_the_connection() {
    enable_tracing();

    let server = ctx(Arc::new(blocks()))
        .create_server(Some("127.0.0.1"), 0, Vec::new())
        .await
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let factory = ctx(Arc::new(NoOpRpcHandler)).create_client_factory(vec![
        Arc::new(RecordOrder {
            name: "refuse",
            order: order.clone(),
            fail: true,
        }),
        Arc::new(RecordOrder {
            name: "never",
            order: order.clone(),
            fail: false,
        }),
    ]);

    let err = factory
        .create_client(server.local_addr())
        .await
        .unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(vec!["refuse"], *order.lock().unwrap());

    iter_check!(1000, {
        if server.connections().is_empty() {
            break;
        }
    });
}

#[tokio::test]
async fn connect_failure_is_transient() {
    enable_tracing();

    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        listener.local_addr().unwrap()
    };

    let factory =
        ctx(Arc::new(NoOpRpcHandler)).create_client_factory(Vec::new());
    let err = factory.create_client(dead).await.unwrap_err();
    assert!(err.is_transient(), "{err}");
}

#[tokio::test]
async fn dropping_the_server_closes_its_connections() {
    enable_tracing();

    let server = ctx(Arc::new(blocks()))
        .create_server_ephemeral(Vec::new())
        .await
        .unwrap();
    let client = ctx(Arc::new(NoOpRpcHandler))
        .create_client_factory(Vec::new())
        .create_client(server.local_addr())
        .await
        .unwrap();
    client
        .send_rpc(BlockId::from("a").to_bytes())
        .await
        .unwrap();

    drop(server);

    iter_check!(1000, {
        if !client.is_active() {
            break;
        }
    });
}
