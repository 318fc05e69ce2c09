//! Schema migrations compiled into the binary.
//!
//! Applied steps are recorded by name in `parley_schema_history`. Each step
//! and its history row commit together, so a failed step leaves no trace.

use rusqlite::Connection;
use std::collections::HashSet;
use thiserror::Error;

/// Ordered schema steps. Append only; never rename an applied step.
const STEPS: &[(&str, &str)] = &[
    ("001_users", include_str!("migrations/001_users.sql")),
    ("002_chats", include_str!("migrations/002_chats.sql")),
    ("003_messages", include_str!("migrations/003_messages.sql")),
];

const HISTORY_DDL: &str = "CREATE TABLE IF NOT EXISTS parley_schema_history (
    name TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("could not prepare schema history: {0}")]
    History(#[source] rusqlite::Error),

    #[error("schema step {step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: rusqlite::Error,
    },
}

/// Brings the schema up to date and returns how many steps were applied.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply_steps(conn, STEPS)
}

fn applied_steps(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    conn.execute_batch(HISTORY_DDL)?;
    let mut stmt = conn.prepare("SELECT name FROM parley_schema_history")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let done = names.collect::<rusqlite::Result<HashSet<String>>>()?;
    Ok(done)
}

fn apply_steps(conn: &Connection, steps: &[(&'static str, &str)]) -> Result<usize, MigrationError> {
    let done = applied_steps(conn).map_err(MigrationError::History)?;

    let mut count = 0;
    for &(step, sql) in steps.iter().filter(|(step, _)| !done.contains(*step)) {
        let fail = |source| MigrationError::Step { step, source };

        let tx = conn.unchecked_transaction().map_err(fail)?;
        tx.execute_batch(sql).map_err(fail)?;
        tx.execute(
            "INSERT INTO parley_schema_history (name) VALUES (?1)",
            [step],
        )
        .map_err(fail)?;
        tx.commit().map_err(fail)?;

        tracing::info!(step, "applied schema step");
        count += 1;
    }

    if count == 0 {
        tracing::debug!(known = done.len(), "schema already current");
    }
    Ok(count)
}
