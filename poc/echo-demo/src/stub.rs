//! Echo service bindings, in the shape a stub generator would emit.

use async_trait::async_trait;
use busrpc::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const SERVICE: &str = "Echo";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub text: String,
}

impl Message for EchoRequest {
    const TYPE_NAME: &'static str = "echo.EchoRequest";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoResponse {
    pub text: String,
    pub served_by: String,
}

impl Message for EchoResponse {
    const TYPE_NAME: &'static str = "echo.EchoResponse";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub seq: u64,
}

impl Message for Ping {
    const TYPE_NAME: &'static str = "echo.Ping";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub seq: u64,
    pub server: String,
}

impl Message for Pong {
    const TYPE_NAME: &'static str = "echo.Pong";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatLine {
    pub text: String,
}

impl Message for ChatLine {
    const TYPE_NAME: &'static str = "echo.ChatLine";
}

/// Method table of the Echo service.
pub fn definition(id: impl Into<String>) -> ServiceDefinition {
    ServiceDefinition::new(SERVICE, id)
        .with_method("Echo", true, false, true)
        .with_method("Ping", false, true, false)
        .with_method("Chat", true, false, true)
}

/// Server-side implementation of the Echo service.
#[async_trait]
pub trait EchoService: Send + Sync + 'static {
    async fn echo(&self, req: EchoRequest) -> RpcResult<EchoResponse>;

    /// How well suited this server is for `req`; negative declines.
    fn echo_affinity(&self, req: &EchoRequest) -> f32;

    async fn ping(&self, req: Ping) -> RpcResult<Pong>;

    async fn chat(&self, stream: Stream<ChatLine, ChatLine>) -> RpcResult<()>;

    fn chat_affinity(&self) -> f32 {
        1.0
    }
}

/// An [`RpcServer`] with every Echo method registered.
pub struct EchoServer {
    rpc: RpcServer,
}

impl EchoServer {
    pub async fn new<S: EchoService>(
        svc: Arc<S>,
        bus: Arc<dyn MessageBus>,
        config: ServerConfig,
        ids: Arc<IdGenerator>,
    ) -> RpcResult<Self> {
        let rpc = RpcServer::new(definition(ids.server_id()), bus, config, ids);

        let affinity: AffinityFn<EchoRequest> = {
            let svc = svc.clone();
            Arc::new(move |req: &EchoRequest| svc.echo_affinity(req))
        };
        let handler = svc.clone();
        rpc.register_handler(
            "Echo",
            &[],
            move |req: EchoRequest| {
                let svc = handler.clone();
                async move { svc.echo(req).await }
            },
            Some(affinity),
        )
        .await?;

        let handler = svc.clone();
        rpc.register_handler(
            "Ping",
            &[],
            move |req: Ping| {
                let svc = handler.clone();
                async move { svc.ping(req).await }
            },
            None,
        )
        .await?;

        let chat_affinity: StreamAffinityFn = {
            let svc = svc.clone();
            Arc::new(move || svc.chat_affinity())
        };
        let handler = svc;
        rpc.register_stream_handler(
            "Chat",
            &[],
            move |stream: Stream<ChatLine, ChatLine>| {
                let svc = handler.clone();
                async move { svc.chat(stream).await }
            },
            Some(chat_affinity),
        )
        .await?;

        Ok(Self { rpc })
    }

    pub fn id(&self) -> &str {
        self.rpc.id()
    }

    /// Finish in-flight calls, then stop.
    pub async fn shutdown(&self) {
        self.rpc.close(false).await;
    }

    /// Stop now, cancelling in-flight calls.
    pub async fn kill(&self) {
        self.rpc.close(true).await;
    }
}

/// Typed client for the Echo service.
pub struct EchoClient {
    rpc: RpcClient,
}

impl EchoClient {
    pub async fn new(bus: Arc<dyn MessageBus>, config: ClientConfig, ids: Arc<IdGenerator>) -> RpcResult<Self> {
        let client_id = ids.client_id();
        let rpc = RpcClient::new(definition(""), client_id, bus, config, ids).await?;
        Ok(Self { rpc })
    }

    pub async fn echo(&self, req: &EchoRequest, opts: RequestOptions) -> RpcResult<EchoResponse> {
        self.rpc.request_single("Echo", &[], req, opts).await
    }

    pub async fn ping(&self, req: &Ping, opts: RequestOptions) -> RpcResult<Vec<MultiResponse<Pong>>> {
        self.rpc.request_multi("Ping", &[], req, opts).await
    }

    pub async fn chat(&self, opts: RequestOptions) -> RpcResult<Stream<ChatLine, ChatLine>> {
        self.rpc.open_stream("Chat", &[], opts).await
    }

    pub async fn close(&self) {
        self.rpc.close().await;
    }
}
