//! SQLite pool construction.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Path that SQLite interprets as a private in-memory database.
const IN_MEMORY: &str = ":memory:";

/// Connection tunables, usually taken from the `[database]` config table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a connection waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Upper bound on pooled connections. Must be at least one.
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

/// Pool shared by the HTTP handlers and the persistence gateway.
pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid database settings: {0}")]
    InvalidSettings(String),

    #[error("failed to open database pool: {0}")]
    Build(#[from] r2d2::Error),
}

/// Opens a pool over the database at `db_path`.
///
/// Every connection runs with WAL journaling, enforced foreign keys and the
/// configured busy timeout. A `:memory:` path is held to a single connection
/// so all checkouts see the same database.
///
/// # Errors
///
/// `PoolError::InvalidSettings` for a blank path or a zero pool size;
/// `PoolError::Build` when the first connection cannot be opened or
/// configured.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    if db_path.trim().is_empty() {
        return Err(PoolError::InvalidSettings(
            "database path is empty".to_string(),
        ));
    }
    if settings.pool_max_size == 0 {
        return Err(PoolError::InvalidSettings(
            "pool_max_size must be at least 1".to_string(),
        ));
    }

    let max_size = if db_path == IN_MEMORY && settings.pool_max_size > 1 {
        tracing::warn!(
            requested = settings.pool_max_size,
            "in-memory database limited to one pooled connection"
        );
        1
    } else {
        settings.pool_max_size
    };

    let busy_timeout_ms = settings.busy_timeout_ms;
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| configure_connection(conn, busy_timeout_ms));

    let pool = Pool::builder().max_size(max_size).build(manager)?;
    tracing::debug!(path = db_path, max_size, "sqlite pool ready");
    Ok(pool)
}

/// Applies per-connection pragmas.
fn configure_connection(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    // SQLite keeps in-memory databases in "memory" mode regardless.
    if !mode.eq_ignore_ascii_case("wal") && !mode.eq_ignore_ascii_case("memory") {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode stayed {mode}")),
        ));
    }
    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;
    conn.execute_batch("PRAGMA foreign_keys = ON")
}
