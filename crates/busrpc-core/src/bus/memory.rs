//! In-process message bus.
//!
//! Fans every published payload out to all current subscribers of the
//! channel. A subscriber whose buffer is full misses the message, the same
//! way a lossy network transport would drop it.

use super::{BusError, BusResult, MessageBus, RawSubscription};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Default)]
struct BusState {
    channels: RwLock<HashMap<String, Vec<(u64, mpsc::Sender<Vec<u8>>)>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl BusState {
    fn unsubscribe(&self, channel: &str, id: u64) {
        let mut channels = self.channels.write();
        if let Some(subs) = channels.get_mut(channel) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                channels.remove(channel);
            }
        }
    }
}

/// Bus that lives inside one process, useful for tests and single-binary
/// deployments.
///
/// # Example
///
/// ```rust
/// use busrpc_core::bus::{InMemoryBus, MessageBus};
///
/// #[tokio::main]
/// async fn main() {
///     let bus = InMemoryBus::new();
///     let mut sub = bus.subscribe("news", 8).await.unwrap();
///     bus.publish("news", b"hi".to_vec()).await.unwrap();
///     assert_eq!(sub.recv().await.unwrap(), b"hi".to_vec());
/// }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<BusState>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .channels
            .read()
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Total publishes accepted so far.
    pub fn published(&self) -> u64 {
        self.state.published.load(Ordering::Relaxed)
    }

    /// Deliveries skipped because a subscriber's buffer was full.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// Refuse further publishes and subscribes, and end every feed.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.channels.write().clear();
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BusResult<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.state.published.fetch_add(1, Ordering::Relaxed);

        let senders: Vec<mpsc::Sender<Vec<u8>>> = match self.state.channels.read().get(channel) {
            Some(subs) => subs.iter().map(|(_, tx)| tx.clone()).collect(),
            None => {
                trace!(channel, "publish with no subscribers");
                return Ok(());
            }
        };

        for tx in senders {
            if tx.try_send(payload.clone()).is_err() {
                self.state.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(channel, "subscriber full or gone, message dropped");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, buffer: usize) -> BusResult<RawSubscription> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));

        let weak: Weak<BusState> = Arc::downgrade(&self.state);
        let name = channel.to_string();
        Ok(RawSubscription::new(channel, rx, move || {
            if let Some(state) = weak.upgrade() {
                state.unsubscribe(&name, id);
            }
            Ok(())
        }))
    }
}

impl std::fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBus")
            .field("channels", &self.state.channels.read().len())
            .finish()
    }
}
