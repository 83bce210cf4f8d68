//! Message bus contract.
//!
//! The framework never owns sockets. Everything it needs from a transport is
//! per-channel publish and per-subscriber fan-out delivery; ordering beyond
//! per-channel FIFO and durability are not assumed. Duplicate or dropped
//! messages are tolerated by the protocol above.

pub mod memory;

pub use memory::InMemoryBus;

use crate::codec::{self, Message};
use crate::error::{RpcError, RpcResult};
use async_trait::async_trait;
use std::marker::PhantomData;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Errors reported by a bus implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,

    #[error("publish to {channel} failed: {reason}")]
    Publish { channel: String, reason: String },

    #[error("subscribe to {channel} failed: {reason}")]
    Subscribe { channel: String, reason: String },
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

impl From<BusError> for RpcError {
    fn from(e: BusError) -> Self {
        RpcError::Bus(e.to_string())
    }
}

/// Abstract publish/subscribe transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an encoded message on `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Subscribe to `channel`, buffering at most `buffer` undelivered messages.
    async fn subscribe(&self, channel: &str, buffer: usize) -> BusResult<RawSubscription>;
}

type Closer = Box<dyn FnOnce() -> BusResult<()> + Send + Sync>;

/// Byte-level subscription handed out by a [`MessageBus`].
pub struct RawSubscription {
    channel: String,
    rx: mpsc::Receiver<Vec<u8>>,
    closer: Option<Closer>,
}

impl RawSubscription {
    /// Wrap a receiver; `closer` detaches it from the bus.
    pub fn new(
        channel: impl Into<String>,
        rx: mpsc::Receiver<Vec<u8>>,
        closer: impl FnOnce() -> BusResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            channel: channel.into(),
            rx,
            closer: Some(Box::new(closer)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Detach from the bus. Later calls are no-ops.
    pub fn close(&mut self) -> BusResult<()> {
        self.rx.close();
        match self.closer.take() {
            Some(closer) => closer(),
            None => Ok(()),
        }
    }
}

impl Drop for RawSubscription {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for RawSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSubscription")
            .field("channel", &self.channel)
            .field("closed", &self.closer.is_none())
            .finish()
    }
}

/// Subscription that decodes every payload as `T`.
#[derive(Debug)]
pub struct Subscription<T: Message> {
    raw: RawSubscription,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Message> Subscription<T> {
    /// Decode the payloads of `raw` as `T`.
    pub fn new(raw: RawSubscription) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn channel(&self) -> &str {
        self.raw.channel()
    }

    /// Next decodable message, or `None` once the feed is closed.
    ///
    /// Payloads that fail to decode are logged and skipped. Channels may
    /// carry more than one message type (request channels also carry
    /// server notifications), so a foreign type is not an error.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let bytes = self.raw.recv().await?;
            match codec::deserialize_as::<T>(&bytes) {
                Ok(msg) => return Some(msg),
                Err(e) => debug!(
                    channel = %self.raw.channel(),
                    error = %e,
                    "skipping message of another type"
                ),
            }
        }
    }

    /// Detach from the bus. Later calls are no-ops.
    pub fn close(&mut self) -> BusResult<()> {
        self.raw.close()
    }
}

/// Encode `msg` and publish it on `channel`.
///
/// # Errors
///
/// [`RpcError::Codec`] if `msg` cannot be encoded, [`RpcError::Bus`] if the
/// bus refuses the publish.
pub async fn publish<M: Message>(bus: &dyn MessageBus, channel: &str, msg: &M) -> RpcResult<()> {
    let payload = codec::serialize(msg)?;
    bus.publish(channel, payload).await?;
    Ok(())
}

/// Subscribe to `channel`, decoding payloads as `T`.
///
/// # Errors
///
/// [`RpcError::Bus`] if the bus refuses the subscription.
pub async fn subscribe<T: Message>(
    bus: &dyn MessageBus,
    channel: &str,
    buffer: usize,
) -> RpcResult<Subscription<T>> {
    let raw = bus.subscribe(channel, buffer).await?;
    Ok(Subscription::new(raw))
}
