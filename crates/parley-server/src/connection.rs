//! Live connection handles and their socket pumps.
//!
//! A [`ConnectionHandle`] is owned by the hub once registered. It holds the
//! only sender of the connection's bounded outbound queue, so dropping the
//! handle closes the queue and lets the write pump finish.
//!
//! Each socket gets two tasks:
//! - the write pump drains the outbound queue to the socket in order and
//!   sends periodic pings;
//! - the read pump decodes chat submissions and forwards them to the hub.
//!
//! Neither pump touches hub state; they talk to it through [`HubHandle`].

use crate::hub::HubHandle;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parley_types::{ChatSubmission, UserId};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

/// Unique identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Token verified, socket upgraded, not yet registered.
    Connecting = 0,
    /// Registered with the hub and receiving frames.
    Open = 1,
    /// Close requested; the handle is on its way out of the registry.
    Closing = 2,
    /// Removed from the registry with its outbound queue closed.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Shared view of a connection's lifecycle state.
///
/// The hub and both pumps hold clones; every transition is a forward-only
/// compare-and-swap, so concurrent closes settle on a single winner.
#[derive(Debug, Clone)]
pub struct Lifecycle(Arc<AtomicU8>);

impl Lifecycle {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Connecting as u8)))
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves `Connecting -> Open`. Returns `false` if the connection already
    /// left `Connecting`.
    fn open(&self) -> bool {
        self.0
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Requests close. Idempotent: returns `true` only for the call that
    /// performed the transition into `Closing`.
    pub fn close(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn finish(&self) {
        self.0
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

/// Why a frame could not be placed on an outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity: the consumer is too slow.
    Full,
    /// The write pump is gone.
    Closed,
}

/// A live connection as held by the hub's registry.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<String>,
    lifecycle: Lifecycle,
}

impl ConnectionHandle {
    /// Creates a handle in `Connecting` together with the receiving end of
    /// its outbound queue.
    pub fn new(user_id: UserId, queue_capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(queue_capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            user_id,
            outbound,
            lifecycle: Lifecycle::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub(crate) fn mark_open(&self) -> bool {
        self.lifecycle.open()
    }

    /// Places a frame on the outbound queue without waiting.
    pub fn try_enqueue(&self, frame: String) -> Result<(), EnqueueError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Closes the handle: marks it `Closing`, drops the queue sender, and
    /// settles in `Closed`.
    pub(crate) fn shutdown(self) {
        self.lifecycle.close();
        let lifecycle = self.lifecycle.clone();
        drop(self);
        lifecycle.finish();
    }
}

/// Per-connection tunables.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Capacity of the outbound queue before the slow-consumer policy evicts.
    pub outbound_queue_capacity: usize,
    /// Largest accepted `content` in a chat submission, in bytes.
    pub max_message_len: usize,
    /// Interval between keepalive pings. `None` disables them.
    pub ping_interval: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            max_message_len: 65_536,
            ping_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Runs a freshly upgraded socket until either side ends.
pub async fn serve(socket: WebSocket, hub: HubHandle, user_id: UserId, settings: ConnectionSettings) {
    let (sink, stream) = socket.split();
    run(sink, stream, hub, user_id, settings).await;
}

/// Registers a connection over an already split transport and drives both
/// pumps until one of them finishes.
///
/// When the write side ends first (eviction or a failed write) the reader is
/// stopped and the connection is unregistered here. When the read side ends
/// first it has already unregistered, and the writer is stopped.
pub async fn run<K, S, E>(sink: K, stream: S, hub: HubHandle, user_id: UserId, settings: ConnectionSettings)
where
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: Send,
    S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (handle, outbound) = ConnectionHandle::new(user_id, settings.outbound_queue_capacity);
    let connection_id = handle.id();
    let lifecycle = handle.lifecycle();

    if hub.register(handle).await.is_err() {
        tracing::error!(user_id, "hub is not running; dropping connection");
        return;
    }

    let mut write_task = tokio::spawn(write_pump(sink, outbound, settings.ping_interval));
    let mut read_task = tokio::spawn(read_pump(
        stream,
        hub.clone(),
        connection_id,
        user_id,
        settings.max_message_len,
    ));

    tokio::select! {
        _ = &mut write_task => {
            read_task.abort();
            lifecycle.close();
            let _ = hub.unregister(connection_id).await;
        }
        _ = &mut read_task => {
            write_task.abort();
        }
    }

    tracing::debug!(%connection_id, user_id, "connection finished");
}

/// Drains `outbound` to `sink` in enqueue order.
///
/// Ends when the queue closes (after sending a Close frame) or when a write
/// fails.
pub async fn write_pump<K>(mut sink: K, mut outbound: mpsc::Receiver<String>, ping_interval: Option<Duration>)
where
    K: Sink<Message> + Unpin,
{
    let mut ticker = ping_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            () = next_tick(&mut ticker) => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Forwards inbound chat submissions to the hub.
///
/// Submissions are accepted only for the connection's own user and within
/// the size limit; anything else is logged and dropped. Issues an
/// Unregister when the socket closes or errors.
pub async fn read_pump<S, E>(
    mut stream: S,
    hub: HubHandle,
    connection_id: ConnectionId,
    user_id: UserId,
    max_message_len: usize,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                tracing::warn!(%connection_id, user_id, "ignoring binary frame");
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(%connection_id, user_id, "websocket receive error: {}", e);
                break;
            }
        };

        let Some(submission) = decode_submission(text.as_str(), user_id, max_message_len) else {
            continue;
        };

        if hub.broadcast(submission).await.is_err() {
            tracing::error!(%connection_id, "hub is not running; closing connection");
            break;
        }
    }

    let _ = hub.unregister(connection_id).await;
}

/// Parses and validates one inbound text frame.
fn decode_submission(text: &str, user_id: UserId, max_message_len: usize) -> Option<ChatSubmission> {
    let submission: ChatSubmission = match serde_json::from_str(text) {
        Ok(submission) => submission,
        Err(e) => {
            tracing::warn!(user_id, "failed to parse incoming chat submission: {}", e);
            return None;
        }
    };

    if submission.user_id != user_id {
        tracing::warn!(
            user_id,
            claimed_user_id = submission.user_id,
            chat_id = submission.chat_id,
            "rejecting submission on behalf of another user"
        );
        return None;
    }

    if submission.content.len() > max_message_len {
        tracing::warn!(
            user_id,
            chat_id = submission.chat_id,
            len = submission.content.len(),
            max = max_message_len,
            "rejecting oversized chat submission"
        );
        return None;
    }

    Some(submission)
}
