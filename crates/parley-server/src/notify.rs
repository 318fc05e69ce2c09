//! Out-of-band pushes to a user's live connections.

use crate::hub::{HubClosed, HubHandle};
use parley_types::{Notification, UserId};
use serde::Serialize;
use thiserror::Error;

/// Why a notification could not be queued.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to serialize notification payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    HubClosed(#[from] HubClosed),
}

/// Fire-and-forget notification entry point handed to collaborators.
///
/// Delivery happens on the hub's dispatch task. Offline users are a no-op and
/// nothing is persisted.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    hub: HubHandle,
}

impl NotificationSink {
    pub fn new(hub: HubHandle) -> Self {
        Self { hub }
    }

    /// Queues `payload` for every live connection of `user_id`.
    pub async fn notify<T: Serialize>(&self, user_id: UserId, payload: &T) -> Result<(), NotifyError> {
        let notification = Notification::new(user_id, payload)?;
        self.hub.send_notification(notification).await?;
        Ok(())
    }

    /// Like [`notify`](Self::notify) but only logs failures.
    pub async fn notify_or_log<T: Serialize>(&self, user_id: UserId, payload: &T) {
        if let Err(e) = self.notify(user_id, payload).await {
            tracing::warn!(user_id, "failed to queue notification: {}", e);
        }
    }
}
