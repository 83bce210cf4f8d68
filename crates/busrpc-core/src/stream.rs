//! Bidirectional streams multiplexed over bus channels.
//!
//! Every data frame carries a fresh correlation id and the sender waits for
//! the peer to acknowledge that id before `send` returns, which turns the
//! fire-and-forget bus into a backpressured channel and surfaces a stalled
//! peer as [`RpcError::AckTimeout`]. The receiving side acknowledges a frame
//! only after it has been queued for `recv`.
//!
//! The same [`StreamCore`] backs both ends; a [`StreamAdapter`] supplies the
//! side-specific part (which channel to publish on, which registry to leave
//! on close).

use crate::codec::{self, Message};
use crate::error::{RpcError, RpcResult};
use crate::ids::IdGenerator;
use crate::time::{expiry_after, now_nanos, remaining};
use crate::wire::{StreamBody, StreamClose, StreamEnvelope, StreamMessage, WireError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Side-specific transport of a stream.
#[async_trait]
pub trait StreamAdapter: Send + Sync {
    /// Deliver an envelope to the peer.
    async fn send(&self, envelope: StreamEnvelope) -> RpcResult<()>;

    /// Called once when the stream closes, to release its id.
    fn close(&self, stream_id: &str);
}

/// Untyped state of one stream.
pub struct StreamCore {
    stream_id: String,
    adapter: Box<dyn StreamAdapter>,
    ids: Arc<IdGenerator>,
    timeout: Duration,
    acks: Mutex<HashMap<String, oneshot::Sender<()>>>,
    recv_tx: mpsc::Sender<StreamMessage>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<StreamMessage>>,
    closed: AtomicBool,
    close_cause: Mutex<Option<RpcError>>,
    done: CancellationToken,
}

impl StreamCore {
    /// Create the state of one stream, open and with no pending acks.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - Id shared by both ends
    /// * `adapter` - Side-specific transport
    /// * `ids` - Source of per-frame correlation ids
    /// * `timeout` - How long `send_raw` waits for an ack
    /// * `buffer` - Received frames held for `recv_raw` before the peer is made to wait
    pub fn new(
        stream_id: impl Into<String>,
        adapter: Box<dyn StreamAdapter>,
        ids: Arc<IdGenerator>,
        timeout: Duration,
        buffer: usize,
    ) -> Arc<Self> {
        let (recv_tx, recv_rx) = mpsc::channel(buffer.max(1));
        Arc::new(Self {
            stream_id: stream_id.into(),
            adapter,
            ids,
            timeout,
            acks: Mutex::new(HashMap::new()),
            recv_tx,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            closed: AtomicBool::new(false),
            close_cause: Mutex::new(None),
            done: CancellationToken::new(),
        })
    }

    /// Id shared by both ends of the stream.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Whether either side has closed the stream.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cause the stream was closed with, if any.
    pub fn err(&self) -> Option<RpcError> {
        self.close_cause.lock().clone()
    }

    /// Cancelled once the stream closes.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Number of frames still waiting for an ack.
    pub fn pending_acks(&self) -> usize {
        self.acks.lock().len()
    }

    fn closed_error(&self) -> RpcError {
        self.err().unwrap_or(RpcError::StreamClosed)
    }

    fn envelope(&self, request_id: String, body: StreamBody) -> StreamEnvelope {
        StreamEnvelope {
            stream_id: self.stream_id.clone(),
            request_id,
            sent_at: now_nanos(),
            expiry: expiry_after(self.timeout),
            body,
        }
    }

    /// Send one frame and wait for its ack.
    pub async fn send_raw(&self, raw: Vec<u8>) -> RpcResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let request_id = self.ids.request_id();
        let rx = self.expect_ack(&request_id);

        let envelope = self.envelope(
            request_id.clone(),
            StreamBody::Message(StreamMessage {
                raw_message: raw,
                message: None,
            }),
        );

        let result = match self.adapter.send(envelope).await {
            Ok(()) => tokio::select! {
                ack = rx => ack.map_err(|_| self.closed_error()),
                _ = tokio::time::sleep(self.timeout) => Err(RpcError::AckTimeout),
                _ = self.done.cancelled() => Err(self.closed_error()),
            },
            Err(e) => Err(e),
        };

        self.forget_ack(&request_id);
        result
    }

    /// Register a waiter for the ack of `request_id`, before the frame it
    /// acknowledges goes out.
    pub fn expect_ack(&self, request_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.acks.lock().insert(request_id.to_string(), tx);
        rx
    }

    /// Drop the waiter registered by [`Self::expect_ack`].
    pub fn forget_ack(&self, request_id: &str) {
        self.acks.lock().remove(request_id);
    }

    /// Next frame, buffered frames first; fails once the stream is closed
    /// and drained.
    pub async fn recv_raw(&self) -> RpcResult<StreamMessage> {
        let mut rx = self.recv_rx.lock().await;
        tokio::select! {
            biased;
            msg = rx.recv() => msg.ok_or_else(|| self.closed_error()),
            _ = self.done.cancelled() => rx.try_recv().map_err(|_| self.closed_error()),
        }
    }

    /// Acknowledge `request_id` to the peer.
    pub async fn ack(&self, request_id: &str) -> RpcResult<()> {
        let envelope = self.envelope(request_id.to_string(), StreamBody::Ack);
        self.adapter.send(envelope).await
    }

    /// Process an envelope routed to this stream.
    pub async fn handle_envelope(&self, envelope: StreamEnvelope) -> RpcResult<()> {
        match envelope.body {
            StreamBody::Open(_) => Ok(()),

            StreamBody::Message(msg) => {
                if self.is_closed() {
                    return Ok(());
                }
                tokio::select! {
                    sent = self.recv_tx.send(msg) => {
                        if sent.is_err() {
                            return Err(self.closed_error());
                        }
                    }
                    _ = tokio::time::sleep(remaining(envelope.expiry)) => {
                        debug!(stream_id = %self.stream_id, "receive buffer full, frame expired");
                        return Err(RpcError::AckTimeout);
                    }
                    _ = self.done.cancelled() => return Ok(()),
                }
                self.ack(&envelope.request_id).await
            }

            StreamBody::Ack => {
                if let Some(tx) = self.acks.lock().remove(&envelope.request_id) {
                    let _ = tx.send(());
                } else {
                    trace!(request_id = %envelope.request_id, "ack for unknown frame");
                }
                Ok(())
            }

            StreamBody::Close(close) => {
                self.close_local(close.error.map(RpcError::from));
                Ok(())
            }
        }
    }

    /// Close the stream and tell the peer. Only the first call has effect;
    /// later calls return [`RpcError::StreamClosed`].
    pub async fn close(&self, cause: Option<RpcError>) -> RpcResult<()> {
        let error = cause.as_ref().map(WireError::from);
        if !self.mark_closed(cause) {
            return Err(RpcError::StreamClosed);
        }

        let request_id = self.ids.request_id();
        let result = self
            .adapter
            .send(self.envelope(request_id, StreamBody::Close(StreamClose { error })))
            .await;
        self.adapter.close(&self.stream_id);
        result
    }

    /// Close without notifying the peer (it closed first).
    pub fn close_local(&self, cause: Option<RpcError>) {
        if self.mark_closed(cause) {
            self.adapter.close(&self.stream_id);
        }
    }

    fn mark_closed(&self, cause: Option<RpcError>) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.close_cause.lock() = cause;
        // Dropping the senders wakes every pending `send_raw`.
        self.acks.lock().clear();
        self.done.cancel();
        debug!(stream_id = %self.stream_id, "stream closed");
        true
    }
}

impl std::fmt::Debug for StreamCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCore")
            .field("stream_id", &self.stream_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Typed handle to a stream that sends `Out` and receives `In`.
pub struct Stream<Out, In> {
    core: Arc<StreamCore>,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<Out: Message, In: Message> Stream<Out, In> {
    /// Wrap an untyped core.
    pub fn from_core(core: Arc<StreamCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    /// Untyped state behind this handle.
    pub fn core(&self) -> &Arc<StreamCore> {
        &self.core
    }

    /// Id shared by both ends of the stream.
    pub fn stream_id(&self) -> &str {
        self.core.stream_id()
    }

    /// Send a message and wait for the peer's ack.
    ///
    /// # Errors
    ///
    /// [`RpcError::AckTimeout`] if the peer does not acknowledge in time,
    /// or the close cause ([`RpcError::StreamClosed`] without one) once the
    /// stream is closed.
    pub async fn send(&self, msg: &Out) -> RpcResult<()> {
        let (raw, _) = codec::serialize_payload(msg)?;
        self.core.send_raw(raw).await
    }

    /// Receive the next message. Frames that arrived before a close are
    /// still delivered.
    ///
    /// # Errors
    ///
    /// The close cause, or [`RpcError::StreamClosed`], once the stream is
    /// closed and drained; a codec error if the frame is not an `In`.
    pub async fn recv(&self) -> RpcResult<In> {
        let msg = self.core.recv_raw().await?;
        codec::deserialize_payload(&msg.raw_message, msg.message.as_ref())
    }

    /// Close the stream, passing `cause` to the peer.
    pub async fn close(&self, cause: Option<RpcError>) -> RpcResult<()> {
        self.core.close(cause).await
    }

    /// Whether either side has closed the stream.
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Cause the stream was closed with, if any.
    pub fn err(&self) -> Option<RpcError> {
        self.core.err()
    }
}

impl<Out, In> Clone for Stream<Out, In> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<Out, In> std::fmt::Debug for Stream<Out, In> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Stream").field(&self.core).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use serde::{Deserialize, Serialize};
    use std::sync::Weak;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Line(String);

    impl Message for Line {
        const TYPE_NAME: &'static str = "test.Line";
    }

    /// Adapter that hands envelopes straight to a peer core.
    #[derive(Default)]
    struct Loopback {
        peer: SyncMutex<Option<Weak<StreamCore>>>,
        sent: SyncMutex<Vec<StreamEnvelope>>,
        released: SyncMutex<Vec<String>>,
        deliver: bool,
    }

    #[async_trait]
    impl StreamAdapter for Arc<Loopback> {
        async fn send(&self, envelope: StreamEnvelope) -> RpcResult<()> {
            self.sent.lock().push(envelope.clone());
            if !self.deliver {
                return Ok(());
            }
            let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
            if let Some(peer) = peer {
                tokio::spawn(async move {
                    let _ = peer.handle_envelope(envelope).await;
                });
            }
            Ok(())
        }

        fn close(&self, stream_id: &str) {
            self.released.lock().push(stream_id.to_string());
        }
    }

    fn pair(timeout: Duration) -> (Arc<Loopback>, Arc<StreamCore>, Arc<Loopback>, Arc<StreamCore>) {
        let ids = Arc::new(IdGenerator::with_seed(3));
        let a_adapter = Arc::new(Loopback {
            deliver: true,
            ..Default::default()
        });
        let b_adapter = Arc::new(Loopback {
            deliver: true,
            ..Default::default()
        });
        let a = StreamCore::new("STR_a", Box::new(a_adapter.clone()), ids.clone(), timeout, 8);
        let b = StreamCore::new("STR_a", Box::new(b_adapter.clone()), ids, timeout, 8);
        *a_adapter.peer.lock() = Some(Arc::downgrade(&b));
        *b_adapter.peer.lock() = Some(Arc::downgrade(&a));
        (a_adapter, a, b_adapter, b)
    }

    #[tokio::test]
    async fn test_send_waits_for_ack() {
        let (a_adapter, a, b_adapter, b) = pair(Duration::from_secs(1));
        let tx: Stream<Line, Line> = Stream::from_core(a);
        let rx: Stream<Line, Line> = Stream::from_core(b);

        tx.send(&Line("hello".into())).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Line("hello".into()));

        let frame = a_adapter.sent.lock()[0].clone();
        let acks: Vec<_> = b_adapter
            .sent
            .lock()
            .iter()
            .filter(|e| e.is_ack())
            .cloned()
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].request_id, frame.request_id);
        assert_eq!(tx.core().pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_ack_timeout_then_close() {
        let ids = Arc::new(IdGenerator::with_seed(5));
        let silent = Arc::new(Loopback::default());
        let core = StreamCore::new(
            "STR_b",
            Box::new(silent.clone()),
            ids,
            Duration::from_millis(50),
            4,
        );
        let stream: Stream<Line, Line> = Stream::from_core(core);

        let err = stream.send(&Line("lost".into())).await.unwrap_err();
        assert_eq!(err, RpcError::AckTimeout);
        assert_eq!(stream.core().pending_acks(), 0);

        stream.close(None).await.unwrap();
        assert!(stream.is_closed());
        assert_eq!(silent.released.lock().as_slice(), ["STR_b".to_string()]);
        assert_eq!(stream.close(None).await, Err(RpcError::StreamClosed));
    }

    #[tokio::test]
    async fn test_peer_close_carries_cause() {
        let (_a_adapter, a, b_adapter, b) = pair(Duration::from_secs(1));
        let left: Stream<Line, Line> = Stream::from_core(a);
        let right: Stream<Line, Line> = Stream::from_core(b);

        let cause = RpcError::new(crate::error::ErrorCode::Internal, "boom");
        left.close(Some(cause.clone())).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), right.recv())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, cause);
        assert!(right.is_closed());
        // The receiving side does not echo a close frame.
        assert!(b_adapter.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_buffered_frames_survive_close() {
        let (_a_adapter, a, _b_adapter, b) = pair(Duration::from_secs(1));
        let tx: Stream<Line, Line> = Stream::from_core(a);
        let rx: Stream<Line, Line> = Stream::from_core(b);

        tx.send(&Line("one".into())).await.unwrap();
        tx.send(&Line("two".into())).await.unwrap();
        tx.close(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(rx.recv().await.unwrap(), Line("one".into()));
        assert_eq!(rx.recv().await.unwrap(), Line("two".into()));
        assert_eq!(rx.recv().await.unwrap_err(), RpcError::StreamClosed);
    }
}
