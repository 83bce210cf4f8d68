//! Stream handler.
//!
//! Listens for stream-open envelopes on the method's server stream channel,
//! races for each open through the claim protocol, and on winning creates a
//! [`StreamCore`] that later frames for the same stream id are routed to.
//!
//! A stream moves through unclaimed, ack-pending, active and closed. Its
//! activity guard is held for the whole life of the stream, so a graceful
//! close waits for running streams to finish.

use crate::claim::{self, Claim, ClaimTable};
use crate::handler::{recv_claim, Completion, RpcHandler};
use async_trait::async_trait;
use busrpc_core::bus::{self, MessageBus, Subscription};
use busrpc_core::channel;
use busrpc_core::codec::Message;
use busrpc_core::config::ServerConfig;
use busrpc_core::drain::{ActivityCounter, ActivityGuard};
use busrpc_core::error::{RpcError, RpcResult};
use busrpc_core::ids::IdGenerator;
use busrpc_core::info::RequestInfo;
use busrpc_core::stream::{Stream, StreamAdapter, StreamCore};
use busrpc_core::time::is_expired;
use busrpc_core::wire::{ClaimResponse, StreamEnvelope};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Type-erased user implementation of a streaming method.
pub type StreamHandlerFn<Out, In> =
    Arc<dyn Fn(Stream<Out, In>) -> BoxFuture<'static, RpcResult<()>> + Send + Sync>;

/// Scores a stream-open for this server. Negative declines it.
pub type StreamAffinityFn = Arc<dyn Fn() -> f32 + Send + Sync>;

type StreamMap = RwLock<HashMap<String, Arc<StreamCore>>>;

/// Publishes server-side frames to the opener's fan-in channel.
struct ServerStreamAdapter {
    bus: Arc<dyn MessageBus>,
    channel: String,
    streams: Weak<StreamMap>,
}

#[async_trait]
impl StreamAdapter for ServerStreamAdapter {
    async fn send(&self, envelope: StreamEnvelope) -> RpcResult<()> {
        bus::publish(self.bus.as_ref(), &self.channel, &envelope).await
    }

    fn close(&self, stream_id: &str) {
        if let Some(streams) = self.streams.upgrade() {
            streams.write().remove(stream_id);
        }
    }
}

struct StreamInner<Out: Message, In: Message> {
    info: RequestInfo,
    server_id: String,
    bus: Arc<dyn MessageBus>,
    ids: Arc<IdGenerator>,
    timeout: Duration,
    channel_size: usize,
    handler: StreamHandlerFn<Out, In>,
    affinity: Option<StreamAffinityFn>,
    streams: Arc<StreamMap>,
    claims: ClaimTable,
    handling: Arc<ActivityCounter>,
    draining: AtomicBool,
    complete: CancellationToken,
    kill: CancellationToken,
}

pub(crate) struct StreamHandler<Out: Message, In: Message> {
    inner: Arc<StreamInner<Out, In>>,
    task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) completion: Completion,
}

impl<Out: Message, In: Message> StreamHandler<Out, In> {
    pub(crate) async fn start(
        info: RequestInfo,
        server_id: String,
        bus: Arc<dyn MessageBus>,
        ids: Arc<IdGenerator>,
        config: &ServerConfig,
        handler: StreamHandlerFn<Out, In>,
        affinity: Option<StreamAffinityFn>,
    ) -> RpcResult<Self> {
        let mut envelopes = bus::subscribe::<StreamEnvelope>(
            bus.as_ref(),
            &info.stream_server_channel(),
            config.channel_size,
        )
        .await?;
        let claims = match bus::subscribe::<ClaimResponse>(
            bus.as_ref(),
            &info.claim_response_channel(),
            config.channel_size,
        )
        .await
        {
            Ok(sub) => sub,
            Err(e) => {
                let _ = envelopes.close();
                return Err(e);
            }
        };

        let inner = Arc::new(StreamInner {
            info,
            server_id,
            bus,
            ids,
            timeout: config.timeout(),
            channel_size: config.channel_size,
            handler,
            affinity,
            streams: Arc::new(RwLock::new(HashMap::new())),
            claims: ClaimTable::default(),
            handling: Arc::new(ActivityCounter::new()),
            draining: AtomicBool::new(false),
            complete: CancellationToken::new(),
            kill: CancellationToken::new(),
        });
        let task = tokio::spawn(inner.clone().run(envelopes, Some(claims)));

        Ok(Self {
            inner,
            task: Mutex::new(Some(task)),
            completion: Completion::default(),
        })
    }
}

impl<Out: Message, In: Message> StreamInner<Out, In> {
    async fn run(
        self: Arc<Self>,
        mut envelopes: Subscription<StreamEnvelope>,
        mut claims: Option<Subscription<ClaimResponse>>,
    ) {
        let mut envelopes_open = true;
        let mut claims_open = true;

        loop {
            tokio::select! {
                _ = self.complete.cancelled() => break,

                msg = envelopes.recv(), if envelopes_open => match msg {
                    Some(env) => self.route(env).await,
                    None => {
                        warn!(channel = %envelopes.channel(), "stream subscription closed");
                        envelopes_open = false;
                    }
                },

                msg = recv_claim(&mut claims), if claims_open => match msg {
                    Some(res) => {
                        self.claims.deliver(res);
                    }
                    None => {
                        warn!(key = %self.info.handler_key(), "claim subscription closed");
                        claims_open = false;
                    }
                },
            }
        }

        let _ = envelopes.close();
        if let Some(mut claims) = claims {
            let _ = claims.close();
        }
        trace!(key = %self.info.handler_key(), "stream loop stopped");
    }

    async fn route(self: &Arc<Self>, env: StreamEnvelope) {
        if let Some(open) = env.open() {
            let node_id = open.node_id.clone();
            let guard = self.handling.enter();
            if self.draining.load(Ordering::SeqCst) || is_expired(env.expiry) {
                trace!(stream_id = %env.stream_id, "stream open ignored");
                return;
            }
            // Opens still racing are deduplicated by the claim table.
            if self.streams.read().contains_key(&env.stream_id) {
                trace!(stream_id = %env.stream_id, "duplicate stream open");
                return;
            }
            let this = Arc::clone(self);
            tokio::spawn(async move { this.serve_stream(env, node_id, guard).await });
            return;
        }

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

    async fn serve_stream(&self, env: StreamEnvelope, node_id: String, _guard: ActivityGuard) {
        let affinity = self.affinity.as_ref().map_or(1.0, |f| f());
        if affinity < 0.0 {
            debug!(stream_id = %env.stream_id, affinity, "stream declined");
            return;
        }

        let claim_channel = channel::claim_request_channel(&self.info.service, &node_id);
        let claim = Claim {
            request_id: &env.request_id,
            server_id: &self.server_id,
            affinity,
            expiry: env.expiry,
            channel: &claim_channel,
        };
        match claim::claim_request(self.bus.as_ref(), &self.claims, claim, &self.kill).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(stream_id = %env.stream_id, error = %e, "failed to publish claim");
                return;
            }
        }

        let adapter = ServerStreamAdapter {
            bus: self.bus.clone(),
            channel: channel::stream_channel(&self.info.service, &node_id),
            streams: Arc::downgrade(&self.streams),
        };
        let core = StreamCore::new(
            env.stream_id.clone(),
            Box::new(adapter),
            self.ids.clone(),
            self.timeout,
            self.channel_size,
        );
        {
            let mut streams = self.streams.write();
            if streams.contains_key(&env.stream_id) {
                debug!(stream_id = %env.stream_id, "stream already active, duplicate open dropped");
                return;
            }
            streams.insert(env.stream_id.clone(), core.clone());
        }

        if let Err(e) = core.ack(&env.request_id).await {
            warn!(stream_id = %env.stream_id, error = %e, "failed to ack stream open");
            core.close_local(Some(e));
            return;
        }
        debug!(stream_id = %env.stream_id, "stream active");

        let stream: Stream<Out, In> = Stream::from_core(core.clone());
        let result = tokio::select! {
            res = (self.handler)(stream) => res,
            _ = self.kill.cancelled() => Err(RpcError::Canceled),
        };
        if let Err(e) = &result {
            debug!(stream_id = %env.stream_id, error = %e, "stream handler failed");
        }
        // Already closed by the peer or a forced close otherwise.
        let _ = core.close(result.err()).await;
    }

    fn active_streams(&self) -> Vec<Arc<StreamCore>> {
        self.streams.read().values().cloned().collect()
    }
}

#[async_trait]
impl<Out: Message, In: Message> RpcHandler for StreamHandler<Out, In> {
    async fn close(&self, force: bool) {
        let inner = &self.inner;
        inner.draining.store(true, Ordering::SeqCst);
        if force {
            self.abort().await;
        }
        inner.handling.wait_idle().await;

        inner.complete.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(key = %inner.info.handler_key(), error = %e, "stream loop failed");
            }
        }
        debug!(key = %inner.info.handler_key(), force, "stream handler closed");
        self.completion.fire();
    }

    async fn abort(&self) {
        self.inner.kill.cancel();
        for stream in self.inner.active_streams() {
            let _ = stream.close(Some(RpcError::Canceled)).await;
        }
    }
}
