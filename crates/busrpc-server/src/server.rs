//! RPC server: handler registry and shutdown.
//!
//! An [`RpcServer`] serves one instance of one service. Each registered
//! `(method, topic)` gets its own handler with its own bus subscriptions and
//! receive loop; the server only tracks them and coordinates shutdown.

use crate::handler::{AffinityFn, Completion, HandlerFn, RpcHandler, UnaryHandler};
use crate::stream_handler::{StreamAffinityFn, StreamHandler, StreamHandlerFn};
use busrpc_core::bus::{self, MessageBus};
use busrpc_core::channel;
use busrpc_core::codec::Message;
use busrpc_core::config::ServerConfig;
use busrpc_core::drain::ActivityCounter;
use busrpc_core::error::{RpcError, RpcResult};
use busrpc_core::ids::IdGenerator;
use busrpc_core::info::{self, ServiceDefinition};
use busrpc_core::stream::Stream;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

struct ServerInner {
    definition: Arc<ServiceDefinition>,
    bus: Arc<dyn MessageBus>,
    config: ServerConfig,
    ids: Arc<IdGenerator>,
    handlers: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
    /// Registered handlers that have not finished closing.
    active: Arc<ActivityCounter>,
    shutting_down: AtomicBool,
    closed: OnceCell<()>,
}

/// Server for one service instance.
///
/// Cloning is cheap; clones share the same registry.
///
/// # Example
///
/// ```rust
/// use busrpc_core::prelude::*;
/// use busrpc_server::RpcServer;
/// use std::sync::Arc;
///
/// # #[derive(Debug, serde::Serialize, serde::Deserialize)]
/// # struct Ping(u32);
/// # impl Message for Ping { const TYPE_NAME: &'static str = "doc.Ping"; }
/// #[tokio::main]
/// async fn main() -> RpcResult<()> {
///     let ids = Arc::new(IdGenerator::new());
///     let definition = ServiceDefinition::new("Pinger", ids.server_id())
///         .with_method("Ping", false, false, true);
///     let server = RpcServer::new(definition, Arc::new(InMemoryBus::new()), ServerConfig::default(), ids);
///
///     server
///         .register_handler("Ping", &[], |req: Ping| async move { Ok::<_, RpcError>(Ping(req.0 + 1)) }, None)
///         .await?;
///     server.close(false).await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    /// Create a server. The definition's id is used as the server id in
    /// every claim and response.
    pub fn new(
        definition: ServiceDefinition,
        bus: Arc<dyn MessageBus>,
        config: ServerConfig,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                definition: Arc::new(definition),
                bus,
                config,
                ids,
                handlers: RwLock::new(HashMap::new()),
                active: Arc::new(ActivityCounter::new()),
                shutting_down: AtomicBool::new(false),
                closed: OnceCell::new(),
            }),
        }
    }

    /// Id this server claims and answers with.
    pub fn id(&self) -> &str {
        &self.inner.definition.id
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.inner.definition
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    /// Handlers registered and not yet fully closed.
    pub fn active_handlers(&self) -> usize {
        self.inner.active.load()
    }

    /// Whether [`Self::close`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Serve a unary method on `topic`.
    ///
    /// `affinity` scores each request when the method runs the claim race;
    /// without one every request scores `1.0`.
    ///
    /// # Errors
    ///
    /// [`RpcError::ServerClosed`] after shutdown began,
    /// [`RpcError::HandlerExists`] if `(method, topic)` is already served,
    /// or a bus error if subscribing fails.
    #[instrument(skip(self, handler, affinity), fields(service = %self.inner.definition.name))]
    pub async fn register_handler<Req, Res, F, Fut>(
        &self,
        method: &str,
        topic: &[&str],
        handler: F,
        affinity: Option<AffinityFn<Req>>,
    ) -> RpcResult<()>
    where
        Req: Message,
        Res: Message,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Res>> + Send + 'static,
    {
        let info = self.inner.definition.get_info(method, &info::topic(topic));
        let key = info.handler_key();
        self.check_registrable(&key)?;

        let handler: HandlerFn<Req, Res> = Arc::new(move |req| handler(req).boxed());
        let unary = Arc::new(
            UnaryHandler::start(
                info,
                self.inner.definition.id.clone(),
                self.inner.bus.clone(),
                &self.inner.config,
                handler,
                affinity,
            )
            .await?,
        );
        self.install(key, unary.clone(), &unary.completion).await
    }

    /// Serve a streaming method on `topic`. The server sends `Out` and
    /// receives `In`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::register_handler`].
    #[instrument(skip(self, handler, affinity), fields(service = %self.inner.definition.name))]
    pub async fn register_stream_handler<Out, In, F, Fut>(
        &self,
        method: &str,
        topic: &[&str],
        handler: F,
        affinity: Option<StreamAffinityFn>,
    ) -> RpcResult<()>
    where
        Out: Message,
        In: Message,
        F: Fn(Stream<Out, In>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<()>> + Send + 'static,
    {
        let info = self.inner.definition.get_info(method, &info::topic(topic));
        let key = info.handler_key();
        self.check_registrable(&key)?;

        let handler: StreamHandlerFn<Out, In> = Arc::new(move |stream| handler(stream).boxed());
        let streaming = Arc::new(
            StreamHandler::start(
                info,
                self.inner.definition.id.clone(),
                self.inner.bus.clone(),
                self.inner.ids.clone(),
                &self.inner.config,
                handler,
                affinity,
            )
            .await?,
        );
        self.install(key, streaming.clone(), &streaming.completion).await
    }

    fn check_registrable(&self, key: &str) -> RpcResult<()> {
        if self.is_shutting_down() {
            return Err(RpcError::ServerClosed);
        }
        if self.inner.handlers.read().contains_key(key) {
            return Err(RpcError::HandlerExists(key.to_string()));
        }
        Ok(())
    }

    /// Put a started handler in the registry, or tear it down if the key
    /// was taken (or shutdown began) while it was subscribing.
    async fn install(
        &self,
        key: String,
        handler: Arc<dyn RpcHandler>,
        completion: &Completion,
    ) -> RpcResult<()> {
        let conflict = {
            let mut handlers = self.inner.handlers.write();
            if self.is_shutting_down() {
                Some(RpcError::ServerClosed)
            } else if handlers.contains_key(&key) {
                Some(RpcError::HandlerExists(key.clone()))
            } else {
                handlers.insert(key.clone(), handler.clone());
                self.inner.active.inc();

                let server = Arc::downgrade(&self.inner);
                let registered = key.clone();
                completion.set(move || {
                    if let Some(server) = server.upgrade() {
                        server.handlers.write().remove(&registered);
                        server.active.dec();
                    }
                });
                None
            }
        };

        match conflict {
            Some(err) => {
                handler.close(true).await;
                Err(err)
            }
            None => {
                info!(key = %key, "handler registered");
                Ok(())
            }
        }
    }

    /// Force-close the handler for `(method, topic)`. No-op if none is
    /// registered.
    #[instrument(skip(self), fields(service = %self.inner.definition.name))]
    pub async fn deregister_handler(&self, method: &str, topic: &[&str]) {
        let key = channel::handler_key(method, &info::topic(topic));
        let handler = self.inner.handlers.read().get(&key).cloned();
        match handler {
            Some(handler) => handler.close(true).await,
            None => debug!(key = %key, "no handler to deregister"),
        }
    }

    /// Broadcast `msg` on the request channel of `(method, topic)`.
    ///
    /// Fire-and-forget: the message goes out bare, not wrapped in a
    /// request, so handlers serving the method skip it and nobody answers.
    /// Every client that joined the channel (`RpcClient::join`) receives it.
    ///
    /// # Errors
    ///
    /// A codec error if `msg` cannot be encoded, or a bus error if the
    /// publish fails.
    pub async fn publish<M: Message>(&self, method: &str, topic: &[&str], msg: &M) -> RpcResult<()> {
        let info = self.inner.definition.get_info(method, &info::topic(topic));
        bus::publish(self.inner.bus.as_ref(), &info.rpc_channel(), msg).await
    }

    /// Shut the server down. Runs once; later calls wait for the first.
    ///
    /// Every handler is closed concurrently. A graceful close (`force ==
    /// false`) lets in-flight requests and streams finish and returns once
    /// all handlers have completed; a forced close cancels them.
    ///
    /// A forced call made while a graceful close is still draining cancels
    /// the in-flight work it was waiting on, then waits for that close to
    /// finish.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # async fn stop(server: busrpc_server::RpcServer) {
    /// let draining = server.clone();
    /// let graceful = tokio::spawn(async move { draining.close(false).await });
    /// // Out of patience: cancel whatever is still running.
    /// server.close(true).await;
    /// graceful.await.ok();
    /// # }
    /// ```
    #[instrument(skip(self), fields(service = %self.inner.definition.name))]
    pub async fn close(&self, force: bool) {
        if force && self.is_shutting_down() && !self.inner.closed.initialized() {
            let handlers: Vec<Arc<dyn RpcHandler>> = self.inner.handlers.read().values().cloned().collect();
            debug!(count = handlers.len(), "aborting a graceful close in progress");
            for handler in handlers {
                handler.abort().await;
            }
        }

        let inner = self.inner.clone();
        self.inner
            .closed
            .get_or_init(|| async move {
                inner.shutting_down.store(true, Ordering::SeqCst);

                let handlers: Vec<Arc<dyn RpcHandler>> = inner.handlers.read().values().cloned().collect();
                debug!(count = handlers.len(), force, "closing handlers");

                let mut closing = JoinSet::new();
                for handler in handlers {
                    closing.spawn(async move { handler.close(force).await });
                }
                while let Some(res) = closing.join_next().await {
                    if let Err(e) = res {
                        warn!(error = %e, "handler close task failed");
                    }
                }

                if !force {
                    inner.active.wait_idle().await;
                }
                info!("server closed");
            })
            .await;
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("service", &self.inner.definition.name)
            .field("id", &self.inner.definition.id)
            .field("handlers", &self.handler_count())
            .finish()
    }
}
