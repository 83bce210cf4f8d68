//! Unary request handler.
//!
//! One background task per registered `(method, topic)` multiplexes the
//! request subscription and the claim-response subscription. Each request is
//! processed on its own task so a slow claim race never blocks delivery.

use crate::claim::{self, Claim, ClaimTable};
use async_trait::async_trait;
use busrpc_core::bus::{self, MessageBus, Subscription};
use busrpc_core::channel;
use busrpc_core::codec::{self, Message};
use busrpc_core::config::ServerConfig;
use busrpc_core::drain::ActivityCounter;
use busrpc_core::error::{ErrorCode, RpcError, RpcResult};
use busrpc_core::info::RequestInfo;
use busrpc_core::time::{is_expired, now_nanos, remaining};
use busrpc_core::wire::{ClaimResponse, Request, Response, WireError};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Type-erased user implementation of a unary method.
pub type HandlerFn<Req, Res> = Arc<dyn Fn(Req) -> BoxFuture<'static, RpcResult<Res>> + Send + Sync>;

/// Scores a request for this server. Negative declines it.
pub type AffinityFn<Req> = Arc<dyn Fn(&Req) -> f32 + Send + Sync>;

/// A registered handler, as seen by the server's registry.
#[async_trait]
pub(crate) trait RpcHandler: Send + Sync {
    /// Stop the handler. `force` cancels in-flight work instead of waiting
    /// for it.
    async fn close(&self, force: bool);

    /// Cancel in-flight work without stopping the receive loop. A graceful
    /// close already in progress then finishes promptly.
    async fn abort(&self);
}

/// Callback fired once when a handler finishes closing.
#[derive(Default)]
pub(crate) struct Completion(Mutex<Option<Box<dyn FnOnce() + Send>>>);

impl Completion {
    pub(crate) fn set(&self, f: impl FnOnce() + Send + 'static) {
        *self.0.lock() = Some(Box::new(f));
    }

    pub(crate) fn fire(&self) {
        let f = self.0.lock().take();
        if let Some(f) = f {
            f();
        }
    }
}

/// Wait on an optional subscription; pends forever when absent.
pub(crate) async fn recv_claim(sub: &mut Option<Subscription<ClaimResponse>>) -> Option<ClaimResponse> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

struct UnaryInner<Req: Message, Res: Message> {
    info: RequestInfo,
    server_id: String,
    bus: Arc<dyn MessageBus>,
    handler: HandlerFn<Req, Res>,
    affinity: Option<AffinityFn<Req>>,
    claims: ClaimTable,
    handling: Arc<ActivityCounter>,
    draining: AtomicBool,
    /// Stops the receive loop.
    complete: CancellationToken,
    /// Cancels in-flight executions.
    kill: CancellationToken,
}

pub(crate) struct UnaryHandler<Req: Message, Res: Message> {
    inner: Arc<UnaryInner<Req, Res>>,
    task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) completion: Completion,
}

impl<Req: Message, Res: Message> UnaryHandler<Req, Res> {
    /// Subscribe and start the receive loop.
    pub(crate) async fn start(
        info: RequestInfo,
        server_id: String,
        bus: Arc<dyn MessageBus>,
        config: &ServerConfig,
        handler: HandlerFn<Req, Res>,
        affinity: Option<AffinityFn<Req>>,
    ) -> RpcResult<Self> {
        let mut requests = bus::subscribe::<Request>(bus.as_ref(), &info.rpc_channel(), config.channel_size).await?;
        let claims = if info.needs_claim() {
            match bus::subscribe::<ClaimResponse>(
                bus.as_ref(),
                &info.claim_response_channel(),
                config.channel_size,
            )
            .await
            {
                Ok(sub) => Some(sub),
                Err(e) => {
                    let _ = requests.close();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let inner = Arc::new(UnaryInner {
            info,
            server_id,
            bus,
            handler,
            affinity,
            claims: ClaimTable::default(),
            handling: Arc::new(ActivityCounter::new()),
            draining: AtomicBool::new(false),
            complete: CancellationToken::new(),
            kill: CancellationToken::new(),
        });
        let task = tokio::spawn(inner.clone().run(requests, claims));

        Ok(Self {
            inner,
            task: Mutex::new(Some(task)),
            completion: Completion::default(),
        })
    }
}

impl<Req: Message, Res: Message> UnaryInner<Req, Res> {
    async fn run(
        self: Arc<Self>,
        mut requests: Subscription<Request>,
        mut claims: Option<Subscription<ClaimResponse>>,
    ) {
        let mut requests_open = true;
        let mut claims_open = claims.is_some();

        loop {
            tokio::select! {
                _ = self.complete.cancelled() => break,

                msg = requests.recv(), if requests_open => match msg {
                    Some(req) => self.dispatch(req),
                    None => {
                        warn!(channel = %requests.channel(), "request subscription closed");
                        requests_open = false;
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

        let _ = requests.close();
        if let Some(mut claims) = claims {
            let _ = claims.close();
        }
        trace!(key = %self.info.handler_key(), "receive loop stopped");
    }

    fn dispatch(self: &Arc<Self>, req: Request) {
        // Counted before the drain check so a concurrent close sees it.
        let guard = self.handling.enter();
        if self.draining.load(Ordering::SeqCst) || is_expired(req.expiry) {
            trace!(request_id = %req.request_id, "request ignored");
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            this.handle_request(req).await;
        });
    }

    async fn handle_request(&self, req: Request) {
        let request: Req = match codec::deserialize_payload(&req.raw_request, req.request.as_ref()) {
            Ok(request) => request,
            Err(e) => {
                let err = RpcError::new(ErrorCode::MalformedRequest, e.to_string());
                self.respond(&req, Err(err)).await;
                return;
            }
        };

        if !req.multi && self.info.needs_claim() {
            let affinity = self.affinity.as_ref().map_or(1.0, |f| f(&request));
            if affinity < 0.0 {
                debug!(request_id = %req.request_id, affinity, "request declined");
                return;
            }

            let claim_channel = channel::claim_request_channel(&self.info.service, &req.client_id);
            let claim = Claim {
                request_id: &req.request_id,
                server_id: &self.server_id,
                affinity,
                expiry: req.expiry,
                channel: &claim_channel,
            };
            match claim::claim_request(self.bus.as_ref(), &self.claims, claim, &self.kill).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(request_id = %req.request_id, error = %e, "failed to publish claim");
                    return;
                }
            }
        }

        let result = tokio::select! {
            res = (self.handler)(request) => res,
            _ = tokio::time::sleep(remaining(req.expiry)) => Err(RpcError::RequestTimeout),
            _ = self.kill.cancelled() => Err(RpcError::Canceled),
        };
        self.respond(&req, result).await;
    }

    async fn respond(&self, req: &Request, result: RpcResult<Res>) {
        let mut response = Response {
            request_id: req.request_id.clone(),
            server_id: self.server_id.clone(),
            sent_at: now_nanos(),
            raw_response: Vec::new(),
            response: None,
            error: None,
        };
        match result.and_then(|res| codec::serialize_payload(&res)) {
            Ok((raw, _)) => response.raw_response = raw,
            Err(e) => response.error = Some(WireError::from(&e)),
        }

        let channel = channel::response_channel(&self.info.service, &req.client_id);
        if let Err(e) = bus::publish(self.bus.as_ref(), &channel, &response).await {
            warn!(request_id = %req.request_id, error = %e, "failed to publish response");
        }
    }
}

#[async_trait]
impl<Req: Message, Res: Message> RpcHandler for UnaryHandler<Req, Res> {
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
                warn!(key = %inner.info.handler_key(), error = %e, "receive loop failed");
            }
        }
        debug!(key = %inner.info.handler_key(), force, "handler closed");
        self.completion.fire();
    }

    async fn abort(&self) {
        self.inner.kill.cancel();
    }
}
