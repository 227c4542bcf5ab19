//! Schema migrations, applied in order and tracked via `PRAGMA user_version`.

use libsql::Connection;

use crate::error::StoreError;

/// Ordered migration steps. Append only — never edit a shipped step.
const MIGRATIONS: &[&str] = &[
    // V1: tickets table. Full record lives in the `data` JSON column;
    // the flat columns exist for indexing and dashboard filters.
    "CREATE TABLE IF NOT EXISTS tickets (
        id          TEXT PRIMARY KEY,
        thread_id   TEXT NOT NULL,
        version     INTEGER NOT NULL,
        day         TEXT NOT NULL,
        stage       TEXT NOT NULL,
        status      TEXT NOT NULL,
        subcategory TEXT,
        team        TEXT,
        data        TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tickets_thread ON tickets(thread_id);
    CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
    CREATE INDEX IF NOT EXISTS idx_tickets_day ON tickets(day);",
    // V2: one durable counter row per calendar day.
    "CREATE TABLE IF NOT EXISTS counters (
        day   TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );",
];

/// Apply all pending migrations.
pub async fn run(conn: &Connection) -> Result<(), StoreError> {
    let current = user_version(conn).await?;

    for (i, step) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(step)
            .await
            .map_err(|e| StoreError::Migration(format!("step {version}: {e}")))?;
        conn.execute(&format!("PRAGMA user_version = {version}"), ())
            .await
            .map_err(|e| StoreError::Migration(format!("set user_version {version}: {e}")))?;
        tracing::debug!(version, "Applied schema migration");
    }
    Ok(())
}

async fn user_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("PRAGMA user_version", ())
        .await
        .map_err(|e| StoreError::Migration(format!("read user_version: {e}")))?;
    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?
        .ok_or_else(|| StoreError::Migration("user_version returned no rows".into()))?;
    row.get::<i64>(0)
        .map_err(|e| StoreError::Migration(e.to_string()))
}
