//! Shared data contracts for the Parley platform.
//!
//! This crate defines the records exchanged between the storage layer, the
//! real-time hub, and connected clients: users, chats, participants,
//! persisted messages, and the JSON frames that travel over a live
//! connection. It carries no behavior beyond construction and (de)serialization
//! so every other crate can depend on it without pulling in I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric identifier of a user account.
pub type UserId = i64;

/// Numeric identifier of a chat.
pub type ChatId = i64;

/// Numeric identifier of a persisted chat message.
pub type MessageId = i64;

/// A registered user as seen by the real-time core.
///
/// Credentials and verification state belong to the account layer and are
/// never loaded here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Client-generated public key, if the user has uploaded one.
    pub public_key: Option<String>,
    /// Private key encrypted client-side. Opaque to the server.
    pub encrypted_private_key: Option<String>,
}

/// A chat room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub name: String,
    pub owner_id: UserId,
    /// The requesting user's encrypted copy of the chat key, present when the
    /// chat was loaded through that user's participation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,
}

/// Membership of one user in one chat.
///
/// `encrypted_key` is per-user encrypted chat-key material produced and
/// consumed by clients. The server stores and returns it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub username: String,
    /// The participant's public key, so members can wrap the chat key for
    /// people they invite.
    pub public_key: Option<String>,
    pub encrypted_key: String,
}

/// Public view of a user returned by directory search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub public_key: Option<String>,
}

/// A persisted chat message. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Client-to-server chat submission sent over a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSubmission {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub content: String,
}

/// Server-to-client frame carrying one delivered chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastFrame {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl BroadcastFrame {
    /// Builds the wire frame for a persisted message and its author's display name.
    pub fn new(message: ChatMessage, username: String) -> Self {
        Self {
            id: message.id,
            chat_id: message.chat_id,
            user_id: message.user_id,
            username,
            content: message.content,
            created_at: message.created_at,
        }
    }
}

/// Out-of-band events pushed to a user's live connections.
///
/// Serialized with a `type` tag so clients can dispatch on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// The user was added to a chat.
    NewChat { chat_id: ChatId },
    /// The user's participation in a chat was removed.
    RemovedFromChat { chat_id: ChatId },
    /// The chat was deleted by its owner.
    ChatDeleted { chat_id: ChatId },
}

/// A transient notification addressed to every live connection of one user.
///
/// Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub user_id: UserId,
    pub payload: Value,
}

impl Notification {
    /// Creates a notification from any serializable payload.
    ///
    /// # Errors
    ///
    /// Returns the serialization error if `payload` cannot be represented as JSON.
    pub fn new<T: Serialize>(user_id: UserId, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            user_id,
            payload: serde_json::to_value(payload)?,
        })
    }
}
