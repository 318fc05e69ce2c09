//! Durable chat model for the Parley platform.
//!
//! Implements user lookup, chat creation, participant management, and
//! message persistence on top of a `rusqlite::Connection`. The real-time
//! hub reaches this crate only through its persistence gateway; HTTP
//! collaborators (invites, participant removal) call it directly.
//!
//! Participant rows carry an opaque, client-encrypted copy of the chat key.
//! Nothing here interprets it.

use chrono::{DateTime, SecondsFormat, Utc};
use parley_types::{Chat, ChatId, ChatMessage, Participant, User, UserId, UserSummary};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

/// Errors that can occur during chat operations.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Parameters for creating a new user record.
#[derive(Debug, Clone, Default)]
pub struct CreateUserParams {
    pub username: String,
    pub email: Option<String>,
    pub public_key: Option<String>,
    pub encrypted_private_key: Option<String>,
}

/// Inserts a user and returns the stored record.
pub fn create_user(conn: &Connection, params: &CreateUserParams) -> Result<User, ChatError> {
    let user = conn.query_row(
        "INSERT INTO users (username, email, public_key, encrypted_private_key)
         VALUES (?1, ?2, ?3, ?4)
         RETURNING id, username, public_key, encrypted_private_key",
        params![
            params.username,
            params.email,
            params.public_key,
            params.encrypted_private_key,
        ],
        map_row_to_user,
    )?;
    Ok(user)
}

/// Retrieves a user by id.
pub fn get_user_by_id(conn: &Connection, user_id: UserId) -> Result<User, ChatError> {
    conn.query_row(
        "SELECT id, username, public_key, encrypted_private_key FROM users WHERE id = ?1",
        [user_id],
        map_row_to_user,
    )
    .optional()?
    .ok_or_else(|| ChatError::NotFound(format!("user {}", user_id)))
}

fn map_row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        public_key: row.get(2)?,
        encrypted_private_key: row.get(3)?,
    })
}

/// Creates a chat owned by `owner_id` and enrolls the owner as its first
/// participant, atomically.
///
/// `owner_key` is the owner's encrypted copy of the chat key.
pub fn create_chat(
    conn: &Connection,
    name: &str,
    owner_id: UserId,
    owner_key: &str,
) -> Result<Chat, ChatError> {
    let tx = conn.unchecked_transaction()?;

    let id: ChatId = tx.query_row(
        "INSERT INTO chats (name, owner_id) VALUES (?1, ?2) RETURNING id",
        params![name, owner_id],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT INTO participants (chat_id, user_id, encrypted_chat_key) VALUES (?1, ?2, ?3)",
        params![id, owner_id, owner_key],
    )?;

    tx.commit()?;

    Ok(Chat {
        id,
        name: name.to_string(),
        owner_id,
        encrypted_key: Some(owner_key.to_string()),
    })
}

/// Retrieves a chat by id.
pub fn get_chat(conn: &Connection, chat_id: ChatId) -> Result<Chat, ChatError> {
    conn.query_row(
        "SELECT id, name, owner_id FROM chats WHERE id = ?1",
        [chat_id],
        |row| {
            Ok(Chat {
                id: row.get(0)?,
                name: row.get(1)?,
                owner_id: row.get(2)?,
                encrypted_key: None,
            })
        },
    )
    .optional()?
    .ok_or_else(|| ChatError::NotFound(format!("chat {}", chat_id)))
}

/// Lists the chats a user participates in, each carrying that user's
/// encrypted chat key.
pub fn list_user_chats(conn: &Connection, user_id: UserId) -> Result<Vec<Chat>, ChatError> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, c.owner_id, p.encrypted_chat_key
         FROM chats c
         JOIN participants p ON c.id = p.chat_id
         WHERE p.user_id = ?1
         ORDER BY c.id ASC",
    )?;

    let rows = stmt.query_map([user_id], |row| {
        Ok(Chat {
            id: row.get(0)?,
            name: row.get(1)?,
            owner_id: row.get(2)?,
            encrypted_key: row.get(3)?,
        })
    })?;

    let mut chats = Vec::new();
    for row in rows {
        chats.push(row?);
    }
    Ok(chats)
}

/// Adds a user to a chat.
///
/// Re-adding an existing participant replaces their encrypted key.
pub fn add_participant(
    conn: &Connection,
    chat_id: ChatId,
    user_id: UserId,
    encrypted_key: &str,
) -> Result<(), ChatError> {
    // Resolve both ends first so a dangling id reports NotFound rather than
    // a foreign key failure.
    get_chat(conn, chat_id)?;
    get_user_by_id(conn, user_id)?;

    conn.execute(
        "INSERT INTO participants (chat_id, user_id, encrypted_chat_key) VALUES (?1, ?2, ?3)
         ON CONFLICT (chat_id, user_id) DO UPDATE SET encrypted_chat_key = excluded.encrypted_chat_key",
        params![chat_id, user_id, encrypted_key],
    )?;
    Ok(())
}

/// Removes a user from a chat. Idempotent.
///
/// Returns `true` if a participation row was deleted.
pub fn remove_participant(
    conn: &Connection,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<bool, ChatError> {
    let count = conn.execute(
        "DELETE FROM participants WHERE chat_id = ?1 AND user_id = ?2",
        [chat_id, user_id],
    )?;
    Ok(count > 0)
}

/// Checks whether a user is a participant of a chat.
pub fn is_participant(
    conn: &Connection,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<bool, ChatError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM participants WHERE chat_id = ?1 AND user_id = ?2)",
        [chat_id, user_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Lists the members of a chat with their public profile, ordered by user id.
pub fn list_participants(
    conn: &Connection,
    chat_id: ChatId,
) -> Result<Vec<Participant>, ChatError> {
    let mut stmt = conn.prepare(
        "SELECT p.chat_id, p.user_id, u.username, u.public_key, p.encrypted_chat_key
         FROM participants p
         JOIN users u ON u.id = p.user_id
         WHERE p.chat_id = ?1
         ORDER BY p.user_id ASC",
    )?;

    let rows = stmt.query_map([chat_id], |row| {
        Ok(Participant {
            chat_id: row.get(0)?,
            user_id: row.get(1)?,
            username: row.get(2)?,
            public_key: row.get(3)?,
            encrypted_key: row.get(4)?,
        })
    })?;

    let mut participants = Vec::new();
    for row in rows {
        participants.push(row?);
    }
    Ok(participants)
}

/// Deletes a chat together with its participation rows and messages.
///
/// Returns `false` if no such chat existed.
pub fn delete_chat(conn: &Connection, chat_id: ChatId) -> Result<bool, ChatError> {
    let tx = conn.unchecked_transaction()?;
    // Explicit child deletes keep this correct on connections opened without
    // foreign key enforcement.
    tx.execute("DELETE FROM messages WHERE chat_id = ?1", [chat_id])?;
    tx.execute("DELETE FROM participants WHERE chat_id = ?1", [chat_id])?;
    let count = tx.execute("DELETE FROM chats WHERE id = ?1", [chat_id])?;
    tx.commit()?;
    Ok(count > 0)
}

/// Finds users whose name contains `query`, case-insensitively.
///
/// A blank query matches nobody. Only public fields are returned.
pub fn search_users(
    conn: &Connection,
    query: &str,
    limit: u32,
) -> Result<Vec<UserSummary>, ChatError> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT id, username, public_key FROM users
         WHERE instr(lower(username), lower(?1)) > 0
         ORDER BY username ASC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![query, limit], |row| {
        Ok(UserSummary {
            id: row.get(0)?,
            username: row.get(1)?,
            public_key: row.get(2)?,
        })
    })?;

    let mut users = Vec::new();
    for row in rows {
        users.push(row?);
    }
    Ok(users)
}

/// Persists a chat message and returns the stored record.
///
/// The timestamp is assigned here, in UTC with millisecond precision, so
/// stored rows sort lexicographically in creation order.
pub fn save_message(
    conn: &Connection,
    chat_id: ChatId,
    user_id: UserId,
    content: &str,
) -> Result<ChatMessage, ChatError> {
    let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    let message = conn.query_row(
        "INSERT INTO messages (chat_id, user_id, content, created_at)
         VALUES (?1, ?2, ?3, ?4)
         RETURNING id, chat_id, user_id, content, created_at",
        params![chat_id, user_id, content, created_at],
        map_row_to_message,
    )?;
    Ok(message)
}

/// Lists messages in a chat, oldest first.
///
/// `limit` defaults to 50 and is capped at 500.
pub fn list_messages(
    conn: &Connection,
    chat_id: ChatId,
    limit: Option<u32>,
) -> Result<Vec<ChatMessage>, ChatError> {
    let limit = limit.unwrap_or(50).min(500);

    // Take the newest `limit` rows, then restore chronological order.
    let mut stmt = conn.prepare(
        "SELECT id, chat_id, user_id, content, created_at FROM (
            SELECT id, chat_id, user_id, content, created_at
            FROM messages
            WHERE chat_id = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
        ) ORDER BY created_at ASC, id ASC",
    )?;

    let rows = stmt.query_map(params![chat_id, limit], map_row_to_message)?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

fn map_row_to_message(row: &Row) -> rusqlite::Result<ChatMessage> {
    let created_at_str: String = row.get(4)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    Ok(ChatMessage {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        user_id: row.get(2)?,
        content: row.get(3)?,
        created_at,
    })
}
