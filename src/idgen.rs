//! Ticket id allocation over the durable day-scoped counter.
//!
//! The store's counter statement is the atomic region; everything here is
//! formatting. A failure reaching the counter surfaces as
//! `StoreError::CounterUnavailable` — callers must abort rather than
//! fabricate an id.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::debug;

use crate::error::StoreError;
use crate::store::TicketStore;
use crate::ticket::{format_final_id, format_temp_id};

/// Allocates unique, monotonically-ordered ticket identifiers.
#[derive(Clone)]
pub struct IdGenerator {
    store: Arc<dyn TicketStore>,
}

impl IdGenerator {
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self { store }
    }

    /// Reserve the next sequence number for `date`.
    pub async fn next(&self, date: NaiveDate) -> Result<u64, StoreError> {
        let day = date.format("%Y%m%d").to_string();
        let seq = self.store.next_sequence(&day).await?;
        debug!(day, seq, "Reserved ticket sequence");
        Ok(seq)
    }

    /// Draw a final ticket id: `TKT-YYYYMMDD-NNNN`.
    pub async fn next_final_id(&self, date: NaiveDate) -> Result<String, StoreError> {
        Ok(format_final_id(date, self.next(date).await?))
    }

    /// Draw a temporary ticket id: `TEMP-<STAGE>-YYYYMMDD-NNNN`.
    pub async fn next_temp_id(
        &self,
        stage_token: &str,
        date: NaiveDate,
    ) -> Result<String, StoreError> {
        Ok(format_temp_id(stage_token, date, self.next(date).await?))
    }
}
