//! Pipeline orchestration: the stage state machine and its CAS discipline.

pub mod engine;

pub use engine::PipelineEngine;

use std::sync::Arc;

use tracing::debug;

use crate::error::PipelineError;
use crate::store::TicketStore;
use crate::ticket::Ticket;

/// Apply `mutate` to the freshest copy of a ticket through compare-and-swap,
/// re-reading and re-applying on a lost race. Returns the written record.
///
/// `mutate` must be a pure function of the ticket (no side effects): it can
/// run several times. Side effects (mail, id draws) happen before or after,
/// never inside.
pub(crate) async fn update_with_cas<F>(
    store: &Arc<dyn TicketStore>,
    id: &str,
    max_retries: u32,
    mutate: F,
) -> Result<Ticket, PipelineError>
where
    F: Fn(&mut Ticket),
{
    for attempt in 1..=max_retries {
        let mut ticket = store
            .get(id)
            .await?
            .ok_or_else(|| crate::error::StoreError::NotFound { id: id.to_string() })?;
        let expected = ticket.version;

        mutate(&mut ticket);
        ticket.version = expected + 1;

        if store.compare_and_swap(id, expected, &ticket).await? {
            return Ok(ticket);
        }
        debug!(id, attempt, "Lost CAS race, re-reading");
    }
    Err(PipelineError::CasExhausted {
        id: id.to_string(),
        attempts: max_retries,
    })
}
