//! libSQL backend — async `TicketStore` implementation.
//!
//! Supports a local database file or `:memory:` for tests. Every record is
//! serialized whole into the `data` column so a `put`/`get` round trip is
//! byte-exact; flat columns mirror the fields the dashboard filters on.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{TicketFilter, TicketStore};
use crate::ticket::{Status, Ticket, ticket_day};

/// Default row cap for unbounded dashboard listings.
const DEFAULT_LIST_LIMIT: usize = 500;

/// libSQL ticket store.
///
/// Holds a single connection reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Backend(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run(&store.conn).await?;
        info!(path = %path.display(), "Ticket store opened");
        Ok(store)
    }

    /// Create an in-memory store (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to create in-memory db: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Backend(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run(&store.conn).await?;
        Ok(store)
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

fn encode(ticket: &Ticket) -> Result<String, StoreError> {
    serde_json::to_string(ticket).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(data: &str) -> Result<Ticket, StoreError> {
    serde_json::from_str(data).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn row_to_ticket(row: &libsql::Row) -> Result<Ticket, StoreError> {
    let data: String = row
        .get(0)
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    decode(&data)
}

fn status_str(status: Status) -> &'static str {
    status.label()
}

#[async_trait]
impl TicketStore for LibSqlStore {
    async fn get(&self, id: &str) -> Result<Option<Ticket>, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT data FROM tickets WHERE id = ?1", params![id])
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_ticket(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_by_thread(&self, thread_id: &str) -> Result<Vec<Ticket>, StoreError> {
        // Active (non-finalized) records sort first so the correlator sees
        // the in-flight ticket before any finalized one on the same thread.
        let mut rows = self
            .conn
            .query(
                "SELECT data FROM tickets
                 WHERE thread_id = ?1 AND status != 'superseded'
                 ORDER BY (status = 'finalized') ASC, created_at ASC",
                params![thread_id],
            )
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
        {
            out.push(row_to_ticket(&row)?);
        }
        Ok(out)
    }

    async fn put(&self, ticket: &Ticket) -> Result<(), StoreError> {
        let day = ticket_day(&ticket.id)
            .ok_or_else(|| StoreError::Constraint(format!("malformed ticket id: {}", ticket.id)))?
            .to_string();
        let data = encode(ticket)?;

        self.conn
            .execute(
                "INSERT INTO tickets
                   (id, thread_id, version, day, stage, status, subcategory, team, data,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                   thread_id = excluded.thread_id,
                   version = excluded.version,
                   day = excluded.day,
                   stage = excluded.stage,
                   status = excluded.status,
                   subcategory = excluded.subcategory,
                   team = excluded.team,
                   data = excluded.data,
                   updated_at = excluded.updated_at",
                params![
                    ticket.id.as_str(),
                    ticket.thread_id.as_str(),
                    ticket.version as i64,
                    day,
                    ticket.stage.label(),
                    status_str(ticket.status),
                    ticket.subcategory.clone(),
                    ticket.team.clone(),
                    data,
                    ticket.created_at.to_rfc3339(),
                    ticket.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        debug!(id = %ticket.id, version = ticket.version, "Ticket written");
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        expected_version: u64,
        new: &Ticket,
    ) -> Result<bool, StoreError> {
        let day = ticket_day(&new.id)
            .ok_or_else(|| StoreError::Constraint(format!("malformed ticket id: {}", new.id)))?
            .to_string();
        let data = encode(new)?;

        // Single conditional UPDATE — the version check and the write are
        // one atomic statement. Terminal records are excluded so finalized
        // history can never be rewritten.
        let affected = self
            .conn
            .execute(
                "UPDATE tickets SET
                   version = ?1, day = ?2, stage = ?3, status = ?4,
                   subcategory = ?5, team = ?6, data = ?7, updated_at = ?8
                 WHERE id = ?9 AND version = ?10
                   AND status NOT IN ('finalized', 'superseded', 'abandoned')",
                params![
                    new.version as i64,
                    day,
                    new.stage.label(),
                    status_str(new.status),
                    new.subcategory.clone(),
                    new.team.clone(),
                    data,
                    new.updated_at.to_rfc3339(),
                    id,
                    expected_version as i64,
                ],
            )
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if affected == 1 {
            debug!(id, version = new.version, stage = %new.stage, "CAS applied");
            return Ok(true);
        }

        // Distinguish a lost race from a terminal/missing record. Terminal
        // statuses never revert, so this second read cannot misclassify.
        let mut rows = self
            .conn
            .query("SELECT status FROM tickets WHERE id = ?1", params![id])
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
        {
            None => Err(StoreError::NotFound { id: id.to_string() }),
            Some(row) => {
                let status: String = row.get(0).map_err(|e| StoreError::Backend(e.to_string()))?;
                if matches!(status.as_str(), "finalized" | "superseded" | "abandoned") {
                    Err(StoreError::Immutable {
                        id: id.to_string(),
                        status,
                    })
                } else {
                    debug!(id, expected_version, "CAS lost race");
                    Ok(false)
                }
            }
        }
    }

    async fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, StoreError> {
        let limit = if filter.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            filter.limit
        } as i64;

        let mut rows = self
            .conn
            .query(
                "SELECT data FROM tickets
                 WHERE (?1 IS NULL OR day >= ?1)
                   AND (?2 IS NULL OR day <= ?2)
                   AND (?3 IS NULL OR status = ?3)
                   AND (?4 IS NULL OR subcategory = ?4)
                   AND (?5 IS NULL OR team = ?5)
                 ORDER BY created_at DESC
                 LIMIT ?6",
                params![
                    filter.from_day.clone(),
                    filter.to_day.clone(),
                    filter.status.map(status_str),
                    filter.subcategory.clone(),
                    filter.team.clone(),
                    limit,
                ],
            )
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
        {
            out.push(row_to_ticket(&row)?);
        }
        Ok(out)
    }

    async fn next_sequence(&self, day: &str) -> Result<u64, StoreError> {
        // Reserve-then-return in one statement: a crash after this commits
        // wastes the number but can never hand it out twice.
        let mut rows = self
            .conn
            .query(
                "INSERT INTO counters (day, value) VALUES (?1, 1)
                 ON CONFLICT(day) DO UPDATE SET value = value + 1
                 RETURNING value",
                params![day],
            )
            .await
            .map_err(|e| StoreError::CounterUnavailable(e.to_string()))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::CounterUnavailable(e.to_string()))?
            .ok_or_else(|| StoreError::CounterUnavailable("counter returned no row".into()))?;
        let value: i64 = row
            .get(0)
            .map_err(|e| StoreError::CounterUnavailable(e.to_string()))?;
        Ok(value as u64)
    }
}
