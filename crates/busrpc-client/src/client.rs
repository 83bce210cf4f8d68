//! RPC client.
//!
//! A client owns three bus subscriptions, all addressed to its client id:
//! responses, claim requests and (optionally) stream frames. One receive
//! loop routes each message to the call or stream waiting for it.

use crate::select::select_server;
use async_trait::async_trait;
use busrpc_core::bus::{self, MessageBus, Subscription};
use busrpc_core::channel;
use busrpc_core::codec::{self, Message};
use busrpc_core::config::{ClientConfig, RequestOptions};
use busrpc_core::error::{ErrorCode, RpcError, RpcResult};
use busrpc_core::ids::IdGenerator;
use busrpc_core::info::{self, RequestInfo, ServiceDefinition};
use busrpc_core::stream::{Stream, StreamAdapter, StreamCore};
use busrpc_core::time::{deadline_after, expiry_after, now_nanos};
use busrpc_core::wire::{ClaimRequest, ClaimResponse, Request, Response, StreamBody, StreamEnvelope, StreamOpen};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

type Pending<T> = Mutex<HashMap<String, mpsc::Sender<T>>>;
type StreamMap = RwLock<HashMap<String, Arc<StreamCore>>>;

/// Waiter for messages correlated with one request id. Leaves the table
/// when dropped.
struct Waiter<'a, T> {
    table: &'a Pending<T>,
    request_id: String,
    rx: mpsc::Receiver<T>,
}

impl<'a, T> Waiter<'a, T> {
    fn register(table: &'a Pending<T>, request_id: &str, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        table.lock().insert(request_id.to_string(), tx);
        Self {
            table,
            request_id: request_id.to_string(),
            rx,
        }
    }
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        self.table.lock().remove(&self.request_id);
    }
}

fn forward<T>(table: &Pending<T>, request_id: &str, msg: T) {
    let tx = table.lock().get(request_id).cloned();
    match tx {
        Some(tx) => {
            if tx.try_send(msg).is_err() {
                debug!(request_id, "waiter full or gone, message dropped");
            }
        }
        None => trace!(request_id, "no waiter for message"),
    }
}

/// One server's answer to a fan-out call.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiResponse<Res> {
    pub server_id: String,
    pub result: RpcResult<Res>,
}

/// Feed of server-published notifications on a method's request channel.
///
/// Requests from other clients share the channel; they decode as a
/// different type and are skipped.
#[derive(Debug)]
pub struct Notifications<M: Message> {
    sub: Subscription<M>,
}

impl<M: Message> Notifications<M> {
    /// Next notification, or `None` once the feed closes.
    pub async fn recv(&mut self) -> Option<M> {
        self.sub.recv().await
    }

    /// Stop receiving notifications.
    pub fn close(&mut self) {
        let _ = self.sub.close();
    }
}

/// Sends client frames to the method's server stream channel.
struct ClientStreamAdapter {
    bus: Arc<dyn MessageBus>,
    channel: String,
    streams: Weak<StreamMap>,
}

#[async_trait]
impl StreamAdapter for ClientStreamAdapter {
    async fn send(&self, envelope: StreamEnvelope) -> RpcResult<()> {
        bus::publish(self.bus.as_ref(), &self.channel, &envelope).await
    }

    fn close(&self, stream_id: &str) {
        if let Some(streams) = self.streams.upgrade() {
            streams.write().remove(stream_id);
        }
    }
}

struct ClientInner {
    definition: ServiceDefinition,
    client_id: String,
    bus: Arc<dyn MessageBus>,
    config: ClientConfig,
    ids: Arc<IdGenerator>,
    responses: Pending<Response>,
    claims: Pending<ClaimRequest>,
    streams: Arc<StreamMap>,
    closed: AtomicBool,
    complete: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Client for one service.
///
/// Cloning is cheap; clones share subscriptions and the receive loop.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Subscribe to this client's channels and start its receive loop.
    ///
    /// # Errors
    ///
    /// Returns a bus error if any subscription fails; subscriptions made
    /// before the failure are released.
    #[instrument(skip_all, fields(service = %definition.name))]
    pub async fn new(
        definition: ServiceDefinition,
        client_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        config: ClientConfig,
        ids: Arc<IdGenerator>,
    ) -> RpcResult<Self> {
        let client_id = client_id.into();
        let service = definition.name.clone();

        // Dropping a subscription detaches it, so `?` unwinds earlier ones.
        let responses = bus::subscribe::<Response>(
            bus.as_ref(),
            &channel::response_channel(&service, &client_id),
            config.channel_size,
        )
        .await?;
        let claims = bus::subscribe::<ClaimRequest>(
            bus.as_ref(),
            &channel::claim_request_channel(&service, &client_id),
            config.channel_size,
        )
        .await?;
        let streams = if config.enable_streams {
            Some(
                bus::subscribe::<StreamEnvelope>(
                    bus.as_ref(),
                    &channel::stream_channel(&service, &client_id),
                    config.channel_size,
                )
                .await?,
            )
        } else {
            None
        };

        let inner = Arc::new(ClientInner {
            definition,
            client_id,
            bus,
            config,
            ids,
            responses: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            streams: Arc::new(RwLock::new(HashMap::new())),
            closed: AtomicBool::new(false),
            complete: CancellationToken::new(),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(inner.clone().run(responses, claims, streams));
        *inner.task.lock() = Some(task);
        debug!(client_id = %inner.client_id, "client started");

        Ok(Self { inner })
    }

    /// Id that names this client's channels.
    pub fn id(&self) -> &str {
        &self.inner.client_id
    }

    /// Streams opened by this client and not yet closed.
    pub fn open_streams(&self) -> usize {
        self.inner.streams.read().len()
    }

    fn check_open(&self) -> RpcResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Canceled);
        }
        Ok(())
    }

    fn request(&self, info: &RequestInfo, payload: Vec<u8>, timeout: Duration) -> Request {
        Request {
            request_id: self.inner.ids.request_id(),
            client_id: self.inner.client_id.clone(),
            sent_at: now_nanos(),
            expiry: expiry_after(timeout),
            multi: info.multi,
            raw_request: payload,
            request: None,
        }
    }

    /// Publish the selector's verdict for `request_id`.
    async fn announce(&self, info: &RequestInfo, request_id: &str, server_id: String) -> RpcResult<()> {
        let verdict = ClaimResponse {
            request_id: request_id.to_string(),
            server_id,
        };
        bus::publish(self.inner.bus.as_ref(), &info.claim_response_channel(), &verdict).await
    }

    /// Call a unary method and wait for one response.
    ///
    /// # Errors
    ///
    /// [`RpcError::NoResponse`] if no server claimed the request,
    /// [`RpcError::RequestTimeout`] if no response arrived in time, or the
    /// handler's error as an [`RpcError::Status`].
    #[instrument(skip(self, req, opts), fields(service = %self.inner.definition.name))]
    pub async fn request_single<Req: Message, Res: Message>(
        &self,
        method: &str,
        topic: &[&str],
        req: &Req,
        opts: RequestOptions,
    ) -> RpcResult<Res> {
        self.check_open()?;
        let info = self.inner.definition.get_info(method, &info::topic(topic));
        let timeout = opts.timeout_or(self.inner.config.timeout());
        let deadline = deadline_after(timeout);

        let (raw, _) = codec::serialize_payload(req)?;
        let request = self.request(&info, raw, timeout);
        let mut responses = Waiter::register(&self.inner.responses, &request.request_id, 1);
        let claims = info
            .needs_claim()
            .then(|| Waiter::register(&self.inner.claims, &request.request_id, self.inner.config.channel_size));

        bus::publish(self.inner.bus.as_ref(), &info.rpc_channel(), &request).await?;

        if let Some(mut claims) = claims {
            let winner = select_server(&mut claims.rx, &opts.selection_for(&info), deadline).await?;
            debug!(request_id = %request.request_id, server_id = %winner, "server selected");
            self.announce(&info, &request.request_id, winner).await?;
        }

        match tokio::time::timeout_at(deadline, responses.rx.recv()).await {
            Ok(Some(response)) => decode_response(&response),
            Ok(None) => Err(RpcError::Canceled),
            Err(_) => Err(RpcError::RequestTimeout),
        }
    }

    /// Call a fan-out method and collect every response that arrives
    /// before the timeout.
    #[instrument(skip(self, req, opts), fields(service = %self.inner.definition.name))]
    pub async fn request_multi<Req: Message, Res: Message>(
        &self,
        method: &str,
        topic: &[&str],
        req: &Req,
        opts: RequestOptions,
    ) -> RpcResult<Vec<MultiResponse<Res>>> {
        self.check_open()?;
        let info = self.inner.definition.get_info(method, &info::topic(topic));
        let timeout = opts.timeout_or(self.inner.config.timeout());
        let deadline = deadline_after(timeout);

        let (raw, _) = codec::serialize_payload(req)?;
        let mut request = self.request(&info, raw, timeout);
        request.multi = true;
        let mut responses = Waiter::register(&self.inner.responses, &request.request_id, self.inner.config.channel_size);

        bus::publish(self.inner.bus.as_ref(), &info.rpc_channel(), &request).await?;

        let mut collected = Vec::new();
        while let Ok(Some(response)) = tokio::time::timeout_at(deadline, responses.rx.recv()).await {
            collected.push(MultiResponse {
                server_id: response.server_id.clone(),
                result: decode_response(&response),
            });
        }
        debug!(request_id = %request.request_id, responses = collected.len(), "fan-out finished");
        Ok(collected)
    }

    /// Open a stream to one server. The client sends `Out` and receives
    /// `In`.
    ///
    /// # Errors
    ///
    /// [`RpcError::StreamsDisabled`] unless the client was built with
    /// streams enabled; otherwise as [`Self::request_single`].
    #[instrument(skip(self, opts), fields(service = %self.inner.definition.name))]
    pub async fn open_stream<Out: Message, In: Message>(
        &self,
        method: &str,
        topic: &[&str],
        opts: RequestOptions,
    ) -> RpcResult<Stream<Out, In>> {
        self.check_open()?;
        if !self.inner.config.enable_streams {
            return Err(RpcError::StreamsDisabled);
        }
        let info = self.inner.definition.get_info(method, &info::topic(topic));
        let timeout = opts.timeout_or(self.inner.config.timeout());
        let deadline = deadline_after(timeout);

        let stream_id = self.inner.ids.stream_id();
        let request_id = self.inner.ids.request_id();
        let adapter = ClientStreamAdapter {
            bus: self.inner.bus.clone(),
            channel: info.stream_server_channel(),
            streams: Arc::downgrade(&self.inner.streams),
        };
        let core = StreamCore::new(
            stream_id.clone(),
            Box::new(adapter),
            self.inner.ids.clone(),
            timeout,
            self.inner.config.channel_size,
        );
        let ack = core.expect_ack(&request_id);
        self.inner.streams.write().insert(stream_id.clone(), core.clone());

        let opened = async {
            let mut claims = Waiter::register(&self.inner.claims, &request_id, self.inner.config.channel_size);
            let open = StreamEnvelope {
                stream_id: stream_id.clone(),
                request_id: request_id.clone(),
                sent_at: now_nanos(),
                expiry: expiry_after(timeout),
                body: StreamBody::Open(StreamOpen {
                    node_id: self.inner.client_id.clone(),
                }),
            };
            bus::publish(self.inner.bus.as_ref(), &info.stream_server_channel(), &open).await?;

            let winner = select_server(&mut claims.rx, &opts.selection_for(&info), deadline).await?;
            debug!(stream_id = %stream_id, server_id = %winner, "stream server selected");
            self.announce(&info, &request_id, winner).await?;

            match tokio::time::timeout_at(deadline, ack).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(core.err().unwrap_or(RpcError::StreamClosed)),
                Err(_) => Err(RpcError::RequestTimeout),
            }
        }
        .await;
        core.forget_ack(&request_id);

        match opened {
            Ok(()) => Ok(Stream::from_core(core)),
            Err(e) => {
                core.close_local(Some(e.clone()));
                Err(e)
            }
        }
    }

    /// Receive server-published notifications for `(method, topic)`.
    ///
    /// # Errors
    ///
    /// [`RpcError::Canceled`] on a closed client, or a bus error if the
    /// subscribe fails.
    pub async fn join<M: Message>(&self, method: &str, topic: &[&str]) -> RpcResult<Notifications<M>> {
        self.check_open()?;
        let info = self.inner.definition.get_info(method, &info::topic(topic));
        let sub = bus::subscribe::<M>(self.inner.bus.as_ref(), &info.rpc_channel(), self.inner.config.channel_size)
            .await?;
        Ok(Notifications { sub })
    }

    /// Stop the receive loop and close every open stream. Pending calls
    /// fail with [`RpcError::Canceled`].
    #[instrument(skip(self), fields(service = %self.inner.definition.name))]
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.complete.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "client loop failed");
            }
        }

        let streams: Vec<Arc<StreamCore>> = self.inner.streams.read().values().cloned().collect();
        for stream in streams {
            let _ = stream.close(Some(RpcError::Canceled)).await;
        }
        self.inner.responses.lock().clear();
        self.inner.claims.lock().clear();
        debug!(client_id = %self.inner.client_id, "client closed");
    }
}

fn decode_response<Res: Message>(response: &Response) -> RpcResult<Res> {
    if let Some(err) = &response.error {
        return Err(err.clone().into());
    }
    codec::deserialize_payload(&response.raw_response, response.response.as_ref())
        .map_err(|e| RpcError::new(ErrorCode::MalformedResponse, e.to_string()))
}

async fn next_envelope(sub: &mut Option<Subscription<StreamEnvelope>>) -> Option<StreamEnvelope> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

impl ClientInner {
    async fn run(
        self: Arc<Self>,
        mut responses: Subscription<Response>,
        mut claims: Subscription<ClaimRequest>,
        mut streams: Option<Subscription<StreamEnvelope>>,
    ) {
        let mut responses_open = true;
        let mut claims_open = true;
        let mut streams_open = streams.is_some();

        loop {
            tokio::select! {
                _ = self.complete.cancelled() => break,

                msg = responses.recv(), if responses_open => match msg {
                    Some(res) => forward(&self.responses, &res.request_id.clone(), res),
                    None => {
                        warn!(client_id = %self.client_id, "response subscription closed");
                        responses_open = false;
                    }
                },

                msg = claims.recv(), if claims_open => match msg {
                    Some(claim) => forward(&self.claims, &claim.request_id.clone(), claim),
                    None => {
                        warn!(client_id = %self.client_id, "claim subscription closed");
                        claims_open = false;
                    }
                },

                msg = next_envelope(&mut streams), if streams_open => match msg {
                    Some(env) => self.route(env).await,
                    None => {
                        warn!(client_id = %self.client_id, "stream subscription closed");
                        streams_open = false;
                    }
                },
            }
        }

        let _ = responses.close();
        let _ = claims.close();
        if let Some(mut streams) = streams {
            let _ = streams.close();
        }
    }

    async fn route(&self, env: StreamEnvelope) {
        let stream = self.streams.read().get(&env.stream_id).cloned();
        match stream {
            Some(stream) => {
                if let Err(e) = stream.handle_envelope(env).await {
                    debug!(stream_id = %stream.stream_id(), error = %e, "failed to handle stream frame");
                }
            }
            None => trace!(stream_id = %env.stream_id, "frame for unknown stream"),
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("service", &self.inner.definition.name)
            .field("id", &self.inner.client_id)
            .finish()
    }
}
