//! The hub: connection registry and serialized dispatch loop.
//!
//! One task owns the registry and consumes a bounded command queue. Every
//! registry read and write happens on that task, so the registry needs no
//! lock. Everyone else holds a cloneable [`HubHandle`] that can only enqueue
//! commands.
//!
//! Broadcast processing per command:
//! 1. confirm the author participates in the chat;
//! 2. persist the message (failure aborts the broadcast);
//! 3. check participation of every online user, skipping users whose check
//!    fails;
//! 4. enqueue the serialized frame on each authorized connection without
//!    waiting, evicting any connection whose queue is full.
//!
//! Participation is evaluated fresh on every broadcast, so membership
//! changes take effect on the next message without reconnecting.

use crate::connection::{ConnectionHandle, ConnectionId, EnqueueError};
use crate::gateway::{PersistenceError, PersistenceGateway};
use crate::notify::NotificationSink;
use parley_types::{BroadcastFrame, ChatSubmission, Notification, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Default capacity of the hub's command queue.
pub const DEFAULT_COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Returned when the dispatch loop is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("hub dispatch loop is not running")]
pub struct HubClosed;

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Registered connections.
    pub connections: usize,
    /// Distinct users with at least one registered connection.
    pub users: usize,
}

/// Commands consumed by the dispatch loop, in arrival order.
#[derive(Debug)]
enum Command {
    Register(ConnectionHandle),
    Unregister(ConnectionId),
    Broadcast(ChatSubmission),
    Notify(Notification),
    Stats(oneshot::Sender<HubStats>),
}

/// Cloneable entry point to a running hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
}

impl HubHandle {
    async fn send(&self, command: Command) -> Result<(), HubClosed> {
        self.commands.send(command).await.map_err(|_| HubClosed)
    }

    /// Queues a Register command. The dispatch loop adds the connection to the
    /// registry and moves it to `Open` when it reaches the command.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), HubClosed> {
        self.send(Command::Register(handle)).await
    }

    /// Removes a connection and closes its outbound queue. No-op if absent.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubClosed> {
        self.send(Command::Unregister(id)).await
    }

    /// Queues a chat submission for persistence and fan-out.
    pub async fn broadcast(&self, submission: ChatSubmission) -> Result<(), HubClosed> {
        self.send(Command::Broadcast(submission)).await
    }

    /// Pushes an out-of-band payload to every live connection of a user.
    pub async fn send_notification(&self, notification: Notification) -> Result<(), HubClosed> {
        self.send(Command::Notify(notification)).await
    }

    /// Snapshot of registry counters, taken in command order.
    pub async fn stats(&self) -> Result<HubStats, HubClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx)).await?;
        rx.await.map_err(|_| HubClosed)
    }

    /// A handle restricted to sending notifications.
    pub fn notifier(&self) -> NotificationSink {
        NotificationSink::new(self.clone())
    }
}

/// Live connections indexed by identity and by owning user.
#[derive(Debug, Default)]
struct Registry {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

impl Registry {
    fn insert(&mut self, handle: ConnectionHandle) {
        self.by_user
            .entry(handle.user_id())
            .or_default()
            .insert(handle.id());
        self.connections.insert(handle.id(), handle);
    }

    fn remove(&mut self, id: ConnectionId) -> Option<ConnectionHandle> {
        let handle = self.connections.remove(&id)?;
        if let Some(ids) = self.by_user.get_mut(&handle.user_id()) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_user.remove(&handle.user_id());
            }
        }
        Some(handle)
    }

    fn get(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.connections.get(&id)
    }

    fn online_users(&self) -> Vec<UserId> {
        self.by_user.keys().copied().collect()
    }

    fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.by_user
            .get(&user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections.len(),
            users: self.by_user.len(),
        }
    }
}

/// Result of authorizing and persisting one broadcast.
struct Delivery {
    frame: String,
    recipients: HashSet<UserId>,
}

/// Why a broadcast produced no delivery.
#[derive(Debug, Error)]
enum BroadcastAbort {
    #[error("author is not a participant of the chat")]
    AuthorNotParticipant,
    #[error("author participation check failed: {0}")]
    AuthorCheck(PersistenceError),
    #[error("failed to save message: {0}")]
    Save(PersistenceError),
    #[error("failed to serialize broadcast frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("blocking persistence task failed: {0}")]
    Task(String),
}

/// The dispatch task's state. Construct with [`Hub::spawn`].
pub struct Hub {
    gateway: Arc<dyn PersistenceGateway>,
    registry: Registry,
    commands: mpsc::Receiver<Command>,
}

impl Hub {
    /// Starts the dispatch loop on the current runtime.
    ///
    /// The loop runs until every [`HubHandle`] is dropped.
    pub fn spawn(gateway: Arc<dyn PersistenceGateway>, command_queue_capacity: usize) -> HubHandle {
        let (tx, rx) = mpsc::channel(command_queue_capacity.max(1));
        let hub = Hub {
            gateway,
            registry: Registry::default(),
            commands: rx,
        };
        tokio::spawn(hub.run());
        HubHandle { commands: tx }
    }

    async fn run(mut self) {
        tracing::debug!("hub dispatch loop started");

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Register(handle) => self.register(handle),
                Command::Unregister(id) => self.unregister(id),
                Command::Broadcast(submission) => self.broadcast(submission).await,
                Command::Notify(notification) => self.notify(notification),
                Command::Stats(reply) => {
                    let _ = reply.send(self.registry.stats());
                }
            }
        }

        let ids: Vec<ConnectionId> = self.registry.connections.keys().copied().collect();
        for id in ids {
            self.unregister(id);
        }
        tracing::debug!("hub dispatch loop stopped");
    }

    fn register(&mut self, handle: ConnectionHandle) {
        if !handle.mark_open() {
            // Closed before the hub ever saw it.
            handle.shutdown();
            return;
        }
        tracing::debug!(
            connection_id = %handle.id(),
            user_id = handle.user_id(),
            "connection registered"
        );
        self.registry.insert(handle);
    }

    fn unregister(&mut self, id: ConnectionId) {
        if let Some(handle) = self.registry.remove(id) {
            tracing::debug!(
                connection_id = %id,
                user_id = handle.user_id(),
                "connection unregistered"
            );
            handle.shutdown();
        }
    }

    fn evict(&mut self, id: ConnectionId) {
        if let Some(handle) = self.registry.remove(id) {
            tracing::warn!(
                connection_id = %id,
                user_id = handle.user_id(),
                "evicting slow consumer"
            );
            handle.shutdown();
        }
    }

    async fn broadcast(&mut self, submission: ChatSubmission) {
        let chat_id = submission.chat_id;
        let author_id = submission.user_id;
        let online = self.registry.online_users();
        let gateway = Arc::clone(&self.gateway);

        let outcome = tokio::task::spawn_blocking(move || {
            authorize_and_persist(gateway.as_ref(), submission, online)
        })
        .await
        .unwrap_or_else(|e| Err(BroadcastAbort::Task(e.to_string())));

        let delivery = match outcome {
            Ok(delivery) => delivery,
            Err(BroadcastAbort::AuthorNotParticipant) => {
                tracing::warn!(
                    chat_id,
                    user_id = author_id,
                    "dropping message from non-participant"
                );
                return;
            }
            Err(e) => {
                tracing::error!(chat_id, user_id = author_id, "broadcast aborted: {}", e);
                return;
            }
        };

        let targets: Vec<ConnectionId> = delivery
            .recipients
            .iter()
            .flat_map(|user_id| self.registry.connections_of(*user_id))
            .collect();

        self.deliver(&targets, &delivery.frame);
    }

    fn notify(&mut self, notification: Notification) {
        let frame = match serde_json::to_string(&notification.payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(
                    user_id = notification.user_id,
                    "failed to serialize notification: {}",
                    e
                );
                return;
            }
        };
        let targets = self.registry.connections_of(notification.user_id);
        self.deliver(&targets, &frame);
    }

    /// Enqueues `frame` on each target without waiting. Full or closed queues
    /// are evicted after the pass so other recipients are unaffected.
    fn deliver(&mut self, targets: &[ConnectionId], frame: &str) {
        let mut evicted = Vec::new();

        for &id in targets {
            let Some(handle) = self.registry.get(id) else {
                continue;
            };
            match handle.try_enqueue(frame.to_owned()) {
                Ok(()) => {}
                Err(EnqueueError::Full) => evicted.push(id),
                Err(EnqueueError::Closed) => {
                    tracing::debug!(connection_id = %id, "outbound queue already closed");
                    evicted.push(id);
                }
            }
        }

        for id in evicted {
            self.evict(id);
        }
    }
}

/// Runs the blocking half of a broadcast: author check, save, recipient
/// checks, and frame serialization.
fn authorize_and_persist(
    gateway: &dyn PersistenceGateway,
    submission: ChatSubmission,
    online: Vec<UserId>,
) -> Result<Delivery, BroadcastAbort> {
    let ChatSubmission {
        chat_id,
        user_id: author_id,
        content,
    } = submission;

    match gateway.is_participant(chat_id, author_id) {
        Ok(true) => {}
        Ok(false) => return Err(BroadcastAbort::AuthorNotParticipant),
        Err(e) => return Err(BroadcastAbort::AuthorCheck(e)),
    }

    let message = gateway
        .save_message(chat_id, author_id, &content)
        .map_err(BroadcastAbort::Save)?;

    let mut recipients = HashSet::new();
    for user_id in online {
        match gateway.is_participant(chat_id, user_id) {
            Ok(true) => {
                recipients.insert(user_id);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(chat_id, user_id, "skipping recipient, participant check failed: {}", e);
            }
        }
    }

    let username = match gateway.get_user_by_id(author_id) {
        Ok(user) => user.username,
        Err(e) => {
            tracing::warn!(user_id = author_id, "failed to resolve author username: {}", e);
            String::new()
        }
    };

    let frame = serde_json::to_string(&BroadcastFrame::new(message, username))?;
    Ok(Delivery { frame, recipients })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use chrono::Utc;
    use parley_types::{ChatEvent, ChatId, ChatMessage, User};
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory gateway with switchable failures.
    #[derive(Default)]
    struct FakeGateway {
        participants: Mutex<HashSet<(ChatId, UserId)>>,
        saved: Mutex<Vec<ChatMessage>>,
        next_id: AtomicI64,
        fail_save: AtomicBool,
        failing_checks: Mutex<HashSet<UserId>>,
    }

    impl FakeGateway {
        fn join(&self, chat_id: ChatId, user_id: UserId) {
            self.participants.lock().unwrap().insert((chat_id, user_id));
        }

        fn leave(&self, chat_id: ChatId, user_id: UserId) {
            self.participants.lock().unwrap().remove(&(chat_id, user_id));
        }

        fn saved_count(&self) -> usize {
            self.saved.lock().unwrap().len()
        }
    }

    impl PersistenceGateway for FakeGateway {
        fn save_message(
            &self,
            chat_id: ChatId,
            user_id: UserId,
            content: &str,
        ) -> Result<ChatMessage, PersistenceError> {
            if self.fail_save.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("save disabled".to_string()));
            }
            let message = ChatMessage {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                chat_id,
                user_id,
                content: content.to_string(),
                created_at: Utc::now(),
            };
            self.saved.lock().unwrap().push(message.clone());
            Ok(message)
        }

        fn is_participant(&self, chat_id: ChatId, user_id: UserId) -> Result<bool, PersistenceError> {
            if self.failing_checks.lock().unwrap().contains(&user_id) {
                return Err(PersistenceError::Unavailable("check disabled".to_string()));
            }
            Ok(self.participants.lock().unwrap().contains(&(chat_id, user_id)))
        }

        fn get_user_by_id(&self, user_id: UserId) -> Result<User, PersistenceError> {
            Ok(User {
                id: user_id,
                username: format!("user{}", user_id),
                public_key: None,
                encrypted_private_key: None,
            })
        }
    }

    fn hub(gateway: &Arc<FakeGateway>) -> HubHandle {
        Hub::spawn(gateway.clone(), 64)
    }

    async fn connect(
        hub: &HubHandle,
        user_id: UserId,
        capacity: usize,
    ) -> (ConnectionId, crate::connection::Lifecycle, mpsc::Receiver<String>) {
        let (handle, rx) = ConnectionHandle::new(user_id, capacity);
        let id = handle.id();
        let lifecycle = handle.lifecycle();
        hub.register(handle).await.unwrap();
        (id, lifecycle, rx)
    }

    fn submit(chat_id: ChatId, user_id: UserId, content: &str) -> ChatSubmission {
        ChatSubmission {
            chat_id,
            user_id,
            content: content.to_string(),
        }
    }

    /// Waits until every previously sent command has been processed.
    async fn settle(hub: &HubHandle) -> HubStats {
        hub.stats().await.unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn broadcast_reaches_participants_only() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.join(10, 1);
        let hub = hub(&gateway);

        let (_, a_state, mut a_rx) = connect(&hub, 1, 8).await;
        let (_, _, mut b_rx) = connect(&hub, 2, 8).await;
        assert_eq!(settle(&hub).await.connections, 2);
        assert_eq!(a_state.state(), ConnectionState::Open);

        hub.broadcast(submit(10, 1, "hi")).await.unwrap();
        settle(&hub).await;

        let frames = drain(&mut a_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["content"], "hi");
        assert_eq!(frames[0]["username"], "user1");
        assert_eq!(frames[0]["chat_id"], 10);
        assert!(!frames[0]["created_at"].is_null());
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn new_participant_receives_next_broadcast_without_reconnecting() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.join(10, 1);
        let hub = hub(&gateway);

        let (_, _, mut a_rx) = connect(&hub, 1, 8).await;
        let (_, _, mut b_rx) = connect(&hub, 2, 8).await;

        hub.broadcast(submit(10, 1, "before")).await.unwrap();
        settle(&hub).await;
        assert!(drain(&mut b_rx).is_empty());

        gateway.join(10, 2);
        hub.broadcast(submit(10, 1, "after")).await.unwrap();
        settle(&hub).await;

        let frames = drain(&mut b_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["content"], "after");
        assert_eq!(drain(&mut a_rx).len(), 2);
    }

    #[tokio::test]
    async fn revoked_participant_stops_receiving() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.join(10, 1);
        gateway.join(10, 2);
        let hub = hub(&gateway);

        let (_, _, mut a_rx) = connect(&hub, 1, 8).await;
        let (_, _, mut b_rx) = connect(&hub, 2, 8).await;

        gateway.leave(10, 2);
        hub.broadcast(submit(10, 1, "private")).await.unwrap();
        settle(&hub).await;

        assert_eq!(drain(&mut a_rx).len(), 1);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn broadcasts_arrive_in_dispatch_order() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.join(10, 1);
        gateway.join(10, 2);
        let hub = hub(&gateway);

        let (_, _, mut a_rx) = connect(&hub, 1, 32).await;
        let (_, _, mut b_rx) = connect(&hub, 2, 32).await;
        let (_, _, mut b2_rx) = connect(&hub, 2, 32).await;

        for i in 0..10 {
            hub.broadcast(submit(10, 1 + (i % 2), &format!("m{}", i)))
                .await
                .unwrap();
        }
        settle(&hub).await;

        for rx in [&mut a_rx, &mut b_rx, &mut b2_rx] {
            let contents: Vec<String> = drain(rx)
                .iter()
                .map(|f| f["content"].as_str().unwrap().to_string())
                .collect();
            let expected: Vec<String> = (0..10).map(|i| format!("m{}", i)).collect();
            assert_eq!(contents, expected);
        }
    }

    #[tokio::test]
    async fn saturated_connection_is_evicted_without_affecting_others() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.join(10, 1);
        gateway.join(10, 2);
        let hub = hub(&gateway);

        let (_, slow_state, mut slow_rx) = connect(&hub, 2, 1).await;
        let (_, fast_state, mut fast_rx) = connect(&hub, 1, 8).await;

        hub.broadcast(submit(10, 1, "first")).await.unwrap();
        hub.broadcast(submit(10, 1, "second")).await.unwrap();
        let stats = settle(&hub).await;

        assert_eq!(stats.connections, 1);
        assert_eq!(slow_state.state(), ConnectionState::Closed);
        assert_eq!(fast_state.state(), ConnectionState::Open);

        assert_eq!(drain(&mut fast_rx).len(), 2);
        // The slow consumer kept what fit, then its queue was closed.
        assert_eq!(slow_rx.recv().await.map(|f| f.contains("first")), Some(true));
        assert_eq!(slow_rx.recv().await, None);
    }

    #[tokio::test]
    async fn failed_save_delivers_nothing_and_hub_keeps_running() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.join(10, 1);
        gateway.join(10, 2);
        let hub = hub(&gateway);

        let (_, _, mut a_rx) = connect(&hub, 1, 8).await;
        let (_, _, mut b_rx) = connect(&hub, 2, 8).await;

        gateway.fail_save.store(true, Ordering::SeqCst);
        hub.broadcast(submit(10, 1, "lost")).await.unwrap();
        settle(&hub).await;
        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut b_rx).is_empty());

        gateway.fail_save.store(false, Ordering::SeqCst);
        hub.broadcast(submit(10, 2, "kept")).await.unwrap();
        settle(&hub).await;

        let a = drain(&mut a_rx);
        let b = drain(&mut b_rx);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0]["content"], "kept");
        assert_eq!(gateway.saved_count(), 1);
    }

    #[tokio::test]
    async fn failed_recipient_check_skips_only_that_recipient() {
        let gateway = Arc::new(FakeGateway::default());
        for user in 1..=3 {
            gateway.join(10, user);
        }
        let hub = hub(&gateway);

        let (_, _, mut a_rx) = connect(&hub, 1, 8).await;
        let (_, _, mut b_rx) = connect(&hub, 2, 8).await;
        let (_, _, mut c_rx) = connect(&hub, 3, 8).await;

        gateway.failing_checks.lock().unwrap().insert(2);
        hub.broadcast(submit(10, 1, "partial")).await.unwrap();
        settle(&hub).await;

        assert_eq!(drain(&mut a_rx).len(), 1);
        assert!(drain(&mut b_rx).is_empty());
        assert_eq!(drain(&mut c_rx).len(), 1);
    }

    #[tokio::test]
    async fn non_participant_author_is_not_persisted() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.join(10, 1);
        let hub = hub(&gateway);

        let (_, _, mut a_rx) = connect(&hub, 1, 8).await;
        hub.broadcast(submit(10, 2, "intrusion")).await.unwrap();
        settle(&hub).await;

        assert_eq!(gateway.saved_count(), 0);
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn notification_reaches_every_connection_of_the_user() {
        let gateway = Arc::new(FakeGateway::default());
        let hub = hub(&gateway);

        let (_, _, mut phone) = connect(&hub, 5, 8).await;
        let (_, _, mut laptop) = connect(&hub, 5, 8).await;
        let (_, _, mut other) = connect(&hub, 6, 8).await;

        let notification = Notification::new(5, &ChatEvent::NewChat { chat_id: 10 }).unwrap();
        hub.send_notification(notification).await.unwrap();
        settle(&hub).await;

        for rx in [&mut phone, &mut laptop] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "new_chat");
            assert_eq!(frames[0]["chat_id"], 10);
        }
        assert!(drain(&mut other).is_empty());
        assert_eq!(gateway.saved_count(), 0);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let gateway = Arc::new(FakeGateway::default());
        let hub = hub(&gateway);

        let (id, lifecycle, mut rx) = connect(&hub, 1, 8).await;
        let (_, _, _keep) = connect(&hub, 1, 8).await;
        assert_eq!(settle(&hub).await, HubStats { connections: 2, users: 1 });

        hub.unregister(id).await.unwrap();
        hub.unregister(id).await.unwrap();
        assert_eq!(settle(&hub).await, HubStats { connections: 1, users: 1 });
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn closed_before_register_is_never_added() {
        let gateway = Arc::new(FakeGateway::default());
        let hub = hub(&gateway);

        let (handle, mut rx) = ConnectionHandle::new(1, 8);
        let lifecycle = handle.lifecycle();
        lifecycle.close();
        hub.register(handle).await.unwrap();

        assert_eq!(settle(&hub).await.connections, 0);
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_loop() {
        let gateway = Arc::new(FakeGateway::default());
        let hub = hub(&gateway);
        let (_, lifecycle, mut rx) = connect(&hub, 1, 8).await;
        settle(&hub).await;

        drop(hub);
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(closed, Ok(None));
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
    }
}
