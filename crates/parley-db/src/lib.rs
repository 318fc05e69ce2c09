//! Database layer for the Parley platform.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations. Every table Parley reads or writes is created
//! through versioned migrations managed by this crate.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: concurrent readers with a single writer, which
//!   matches the access pattern of the real-time hub (one persisting writer,
//!   many participation lookups).
//! - **`r2d2` connection pool**: bounded connection reuse for blocking
//!   queries issued from `spawn_blocking` tasks.
//! - **Embedded migrations**: schema steps are compiled in with
//!   `include_str!` and recorded in `parley_schema_history`.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
