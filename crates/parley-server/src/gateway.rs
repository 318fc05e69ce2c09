//! Persistence contract consumed by the hub.
//!
//! The hub never touches SQL directly. It calls a [`PersistenceGateway`]
//! from blocking tasks, so implementations are free to perform synchronous
//! I/O.

use parley_chats::ChatError;
use parley_db::DbPool;
use parley_types::{ChatId, ChatMessage, User, UserId};
use thiserror::Error;

/// Errors surfaced by a persistence gateway.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// No connection could be checked out of the pool.
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),
    /// The store rejected or failed the query.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The backend could not be reached or the blocking task failed.
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
}

impl From<ChatError> for PersistenceError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Database(e) => Self::Database(e),
            ChatError::NotFound(what) => Self::NotFound(what),
        }
    }
}

/// Durable storage operations the real-time core depends on.
pub trait PersistenceGateway: Send + Sync + 'static {
    /// Persists a message and returns the stored record.
    fn save_message(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        content: &str,
    ) -> Result<ChatMessage, PersistenceError>;

    /// Reports whether `user_id` currently participates in `chat_id`.
    fn is_participant(&self, chat_id: ChatId, user_id: UserId) -> Result<bool, PersistenceError>;

    /// Loads a user record.
    fn get_user_by_id(&self, user_id: UserId) -> Result<User, PersistenceError>;
}

/// [`PersistenceGateway`] backed by the SQLite pool.
#[derive(Clone)]
pub struct SqliteGateway {
    pool: DbPool,
}

impl SqliteGateway {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl PersistenceGateway for SqliteGateway {
    fn save_message(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        content: &str,
    ) -> Result<ChatMessage, PersistenceError> {
        let conn = self.pool.get()?;
        Ok(parley_chats::save_message(&conn, chat_id, user_id, content)?)
    }

    fn is_participant(&self, chat_id: ChatId, user_id: UserId) -> Result<bool, PersistenceError> {
        let conn = self.pool.get()?;
        Ok(parley_chats::is_participant(&conn, chat_id, user_id)?)
    }

    fn get_user_by_id(&self, user_id: UserId) -> Result<User, PersistenceError> {
        let conn = self.pool.get()?;
        Ok(parley_chats::get_user_by_id(&conn, user_id)?)
    }
}
