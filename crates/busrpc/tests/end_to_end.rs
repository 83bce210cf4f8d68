//! Servers and clients talking over one in-memory bus.

use busrpc::prelude::*;
use busrpc::core::channel;
use busrpc::core::wire::ClaimRequest;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SERVICE: &str = "Rooms";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Line(String);

impl Message for Line {
    const TYPE_NAME: &'static str = "rooms.Line";
}

fn definition(id: String) -> ServiceDefinition {
    ServiceDefinition::new(SERVICE, id)
        .with_method("Join", true, false, true)
        .with_method("Who", false, true, false)
        .with_method("Talk", true, false, true)
        .with_method("Announce", false, true, false)
}

struct Cluster {
    bus: InMemoryBus,
    ids: Arc<IdGenerator>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            bus: InMemoryBus::new(),
            ids: Arc::new(IdGenerator::with_seed(99)),
        }
    }

    fn server(&self) -> RpcServer {
        RpcServer::new(
            definition(self.ids.server_id()),
            Arc::new(self.bus.clone()),
            ServerConfig::default(),
            self.ids.clone(),
        )
    }

    async fn client(&self) -> RpcClient {
        RpcClient::new(
            definition(String::new()),
            self.ids.client_id(),
            Arc::new(self.bus.clone()),
            ClientConfig::default().with_timeout(Duration::from_secs(2)).with_streams(),
            self.ids.clone(),
        )
        .await
        .unwrap()
    }
}

async fn serve_join(server: &RpcServer, score: f32, calls: Arc<AtomicUsize>) {
    let name = server.id().to_string();
    let affinity: AffinityFn<Line> = Arc::new(move |_: &Line| score);
    server
        .register_handler(
            "Join",
            &[],
            move |req: Line| {
                calls.fetch_add(1, Ordering::SeqCst);
                let name = name.clone();
                async move { Ok::<_, RpcError>(Line(format!("{} joined via {name}", req.0))) }
            },
            Some(affinity),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_highest_affinity_server_executes() {
    let cluster = Cluster::new();
    let low = cluster.server();
    let high = cluster.server();
    let low_calls = Arc::new(AtomicUsize::new(0));
    let high_calls = Arc::new(AtomicUsize::new(0));
    serve_join(&low, 0.2, low_calls.clone()).await;
    serve_join(&high, 0.8, high_calls.clone()).await;

    let client = cluster.client().await;
    let opts = RequestOptions::new().with_selection(SelectionConfig {
        affinity_timeout_ms: 200,
        short_circuit_timeout_ms: 0,
        ..SelectionConfig::default()
    });
    let reply: Line = client
        .request_single("Join", &[], &Line("ana".into()), opts)
        .await
        .unwrap();

    assert_eq!(reply, Line(format!("ana joined via {}", high.id())));
    assert_eq!(high_calls.load(Ordering::SeqCst), 1);
    assert_eq!(low_calls.load(Ordering::SeqCst), 0);

    client.close().await;
    low.close(false).await;
    high.close(false).await;
}

#[tokio::test]
async fn test_no_servers_gives_no_response() {
    let cluster = Cluster::new();
    let client = cluster.client().await;

    let err = client
        .request_single::<Line, Line>("Join", &[], &Line("nobody".into()), RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::NoResponse);

    let err = client
        .open_stream::<Line, Line>("Talk", &[], RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::NoResponse);
}

#[tokio::test]
async fn test_fan_out_reaches_every_server() {
    let cluster = Cluster::new();
    let servers: Vec<RpcServer> = (0..3).map(|_| cluster.server()).collect();
    for server in &servers {
        let name = server.id().to_string();
        server
            .register_handler(
                "Who",
                &[],
                move |_: Line| {
                    let name = name.clone();
                    async move { Ok::<_, RpcError>(Line(name)) }
                },
                None,
            )
            .await
            .unwrap();
    }

    let client = cluster.client().await;
    let opts = RequestOptions::new().with_timeout(Duration::from_millis(300));
    let responses = client
        .request_multi::<Line, Line>("Who", &[], &Line("roll call".into()), opts)
        .await
        .unwrap();

    let mut names: Vec<String> = responses
        .into_iter()
        .map(|r| r.result.unwrap().0)
        .collect();
    names.sort();
    let mut expected: Vec<String> = servers.iter().map(|s| s.id().to_string()).collect();
    expected.sort();
    assert_eq!(names, expected);
}

#[tokio::test]
async fn test_stream_echo_round_trip() {
    let cluster = Cluster::new();
    let server = cluster.server();
    let affinity: StreamAffinityFn = Arc::new(|| 1.0);
    server
        .register_stream_handler(
            "Talk",
            &[],
            |stream: Stream<Line, Line>| async move {
                loop {
                    let line = match stream.recv().await {
                        Ok(line) => line,
                        Err(RpcError::StreamClosed) => return Ok::<_, RpcError>(()),
                        Err(e) => return Err(e),
                    };
                    stream.send(&Line(line.0.to_uppercase())).await?;
                }
            },
            Some(affinity),
        )
        .await
        .unwrap();

    let client = cluster.client().await;
    let mut claims = busrpc::core::bus::subscribe::<ClaimRequest>(
        &cluster.bus,
        &channel::claim_request_channel(SERVICE, client.id()),
        8,
    )
    .await
    .unwrap();

    let stream: Stream<Line, Line> = client
        .open_stream("Talk", &[], RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(client.open_streams(), 1);

    // Exactly one claim for the open.
    assert!(claims.recv().await.is_some());

    for word in ["hello", "bus"] {
        stream.send(&Line(word.into())).await.unwrap();
        assert_eq!(stream.recv().await.unwrap(), Line(word.to_uppercase()));
    }
    assert!(tokio::time::timeout(Duration::from_millis(50), claims.recv()).await.is_err());

    stream.close(None).await.unwrap();
    assert!(stream.is_closed());
    assert_eq!(client.open_streams(), 0);

    server.close(false).await;
    assert_eq!(server.handler_count(), 0);
}

#[tokio::test]
async fn test_server_error_closes_stream_with_cause() {
    let cluster = Cluster::new();
    let server = cluster.server();
    server
        .register_stream_handler(
            "Talk",
            &[],
            |stream: Stream<Line, Line>| async move {
                let line = stream.recv().await?;
                Err::<(), _>(RpcError::new(ErrorCode::InvalidArgument, format!("rude: {}", line.0)))
            },
            None,
        )
        .await
        .unwrap();

    let client = cluster.client().await;
    let stream: Stream<Line, Line> = client
        .open_stream("Talk", &[], RequestOptions::new())
        .await
        .unwrap();
    stream.send(&Line("boo".into())).await.unwrap();

    let err = stream.recv().await.unwrap_err();
    assert_eq!(err, RpcError::new(ErrorCode::InvalidArgument, "rude: boo"));
    assert!(stream.is_closed());
    server.close(false).await;
}

#[tokio::test]
async fn test_huge_timeout_is_not_treated_as_expired() {
    let cluster = Cluster::new();
    let server = cluster.server();
    let calls = Arc::new(AtomicUsize::new(0));
    serve_join(&server, 0.5, calls.clone()).await;

    let client = cluster.client().await;
    let opts = RequestOptions::new()
        .with_timeout(Duration::from_secs(u64::MAX / 4))
        .with_selection(SelectionConfig {
            accept_first_available: true,
            ..SelectionConfig::default()
        });
    let reply: Line = tokio::time::timeout(
        Duration::from_secs(2),
        client.request_single("Join", &[], &Line("bo".into()), opts),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(reply, Line(format!("bo joined via {}", server.id())));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    client.close().await;
    server.close(false).await;
}

#[tokio::test]
async fn test_server_publish_reaches_joined_clients() {
    let cluster = Cluster::new();
    let server = cluster.server();
    let client = cluster.client().await;
    let mut feed = client.join::<Line>("Announce", &["lobby"]).await.unwrap();

    server
        .publish("Announce", &["lobby"], &Line("doors open".into()))
        .await
        .unwrap();

    let note = tokio::time::timeout(Duration::from_secs(1), feed.recv()).await.unwrap();
    assert_eq!(note, Some(Line("doors open".into())));
}

#[tokio::test]
async fn test_graceful_close_lets_stream_finish() {
    let cluster = Cluster::new();
    let server = cluster.server();
    server
        .register_stream_handler(
            "Talk",
            &[],
            |stream: Stream<Line, Line>| async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                stream.send(&Line("bye".into())).await?;
                Ok::<_, RpcError>(())
            },
            None,
        )
        .await
        .unwrap();

    let client = cluster.client().await;
    let stream: Stream<Line, Line> = client
        .open_stream("Talk", &[], RequestOptions::new())
        .await
        .unwrap();

    let closing = {
        let server = server.clone();
        tokio::spawn(async move { server.close(false).await })
    };
    assert_eq!(stream.recv().await.unwrap(), Line("bye".into()));
    closing.await.unwrap();
    assert_eq!(server.active_handlers(), 0);
    assert_eq!(stream.recv().await.unwrap_err(), RpcError::StreamClosed);
}
