//! `TicketStore` — single async interface for ticket persistence and the
//! durable day-scoped counter.
//!
//! All mutation after creation goes through `compare_and_swap`; the store is
//! the serialization authority for concurrent workers. Temporary and final
//! records are ordinary rows distinguished by status and id prefix.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::ticket::{Status, Ticket};

/// Read-side filter for the dashboard query surface.
///
/// Days are `YYYYMMDD` strings matching the day component of ticket ids.
#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    pub from_day: Option<String>,
    pub to_day: Option<String>,
    pub status: Option<Status>,
    pub subcategory: Option<String>,
    pub team: Option<String>,
    /// Maximum rows returned; 0 means the backend default.
    pub limit: usize,
}

/// Backend-agnostic ticket store.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Fetch a ticket by id.
    async fn get(&self, id: &str) -> Result<Option<Ticket>, StoreError>;

    /// All non-superseded tickets on a thread, active (non-finalized)
    /// records first. Correlation policy lives in the caller.
    async fn find_by_thread(&self, thread_id: &str) -> Result<Vec<Ticket>, StoreError>;

    /// Insert or fully replace a record. Used for creation; every
    /// subsequent mutation must go through `compare_and_swap`.
    async fn put(&self, ticket: &Ticket) -> Result<(), StoreError>;

    /// Conditionally replace the record for `id` if its stored version is
    /// `expected_version`. Returns `false` on a lost race (caller re-reads
    /// and retries). Terminal records (finalized/superseded/abandoned)
    /// reject mutation with `StoreError::Immutable`.
    async fn compare_and_swap(
        &self,
        id: &str,
        expected_version: u64,
        new: &Ticket,
    ) -> Result<bool, StoreError>;

    /// Dashboard listing: filter by day range, status, subcategory, team.
    /// Read-only; eventual consistency is acceptable.
    async fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, StoreError>;

    /// Atomically reserve and return the next sequence number for a
    /// calendar day (`YYYYMMDD`). Strictly increasing, durable, never
    /// rewound; a reserved-but-unused number is an acceptable gap.
    async fn next_sequence(&self, day: &str) -> Result<u64, StoreError>;
}
