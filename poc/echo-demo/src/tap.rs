//! Bus wrapper that logs the type of every published message.

use async_trait::async_trait;
use busrpc::core::bus::{BusResult, MessageBus, RawSubscription};
use busrpc::core::codec::TypeRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub struct TracingBus<B> {
    inner: B,
    registry: TypeRegistry,
    unknown: AtomicU64,
}

impl<B: MessageBus> TracingBus<B> {
    pub fn new(inner: B, registry: TypeRegistry) -> Self {
        Self {
            inner,
            registry,
            unknown: AtomicU64::new(0),
        }
    }

    /// Publishes whose payload the registry could not decode.
    pub fn unknown(&self) -> u64 {
        self.unknown.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<B: MessageBus> MessageBus for TracingBus<B> {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BusResult<()> {
        match self.registry.deserialize(&payload) {
            Ok(msg) => debug!(channel, kind = msg.type_name(), bytes = payload.len(), "publish"),
            Err(_) => {
                self.unknown.fetch_add(1, Ordering::Relaxed);
                debug!(channel, bytes = payload.len(), "publish of unregistered type");
            }
        }
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str, buffer: usize) -> BusResult<RawSubscription> {
        debug!(channel, buffer, "subscribe");
        self.inner.subscribe(channel, buffer).await
    }
}
