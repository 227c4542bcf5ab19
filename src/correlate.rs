//! Thread correlation: deciding what an inbound message means.
//!
//! Every message resolves to exactly one disposition against the store's
//! thread index. At most one active (non-terminal) ticket may exist per
//! thread; finding more than one is a store invariant violation and is
//! surfaced rather than guessed around.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{PipelineError, StoreError};
use crate::store::TicketStore;
use crate::ticket::{Status, Ticket};

/// What an inbound message turned out to be.
#[derive(Debug)]
pub enum Disposition {
    /// No active ticket on the thread: start a new pipeline run.
    /// Covers genuinely new threads and replies to finalized tickets.
    NewThread,
    /// The thread's ticket is suspended on a follow-up; this message is
    /// the awaited reply (or a late reply to a stalled ticket).
    Resume(Box<Ticket>),
    /// The thread's ticket is mid-flight with no follow-up pending; fold
    /// the message into its transcript for later extraction passes.
    InFlightUpdate(Box<Ticket>),
    /// The message id is already in the ticket's transcript: a redelivery.
    Duplicate { ticket_id: String },
}

/// Resolves inbound messages to tickets through the thread index.
#[derive(Clone)]
pub struct ThreadCorrelator {
    store: Arc<dyn TicketStore>,
}

impl ThreadCorrelator {
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self { store }
    }

    /// Classify `message_id` on `thread_id` against the store.
    pub async fn resolve(
        &self,
        thread_id: &str,
        message_id: &str,
    ) -> Result<Disposition, PipelineError> {
        let tickets = self.store.find_by_thread(thread_id).await?;

        let active: Vec<&Ticket> = tickets
            .iter()
            .filter(|t| !t.status.is_immutable())
            .collect();

        if active.len() > 1 {
            warn!(
                thread_id,
                count = active.len(),
                "Multiple active tickets on one thread"
            );
            return Err(PipelineError::CorrelationAmbiguous {
                thread_id: thread_id.to_string(),
                count: active.len(),
            });
        }

        let Some(ticket) = active.first() else {
            // Redeliveries of messages a retired ticket already folded in
            // must not open a fresh ticket.
            if let Some(seen) = tickets.iter().find(|t| t.has_seen_message(message_id)) {
                debug!(thread_id, message_id, ticket_id = %seen.id, "Duplicate on retired ticket");
                return Ok(Disposition::Duplicate {
                    ticket_id: seen.id.clone(),
                });
            }
            debug!(thread_id, "No active ticket, treating as new thread");
            return Ok(Disposition::NewThread);
        };

        if ticket.has_seen_message(message_id) {
            debug!(thread_id, message_id, ticket_id = %ticket.id, "Duplicate delivery");
            return Ok(Disposition::Duplicate {
                ticket_id: ticket.id.clone(),
            });
        }

        // Re-fetch by id so the caller holds the freshest version for CAS.
        let fresh = self
            .store
            .get(&ticket.id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                id: ticket.id.clone(),
            })?;

        match fresh.status {
            Status::AwaitingResponse | Status::Stalled => {
                debug!(thread_id, ticket_id = %fresh.id, kind = ?fresh.pending_followup.as_ref().map(|p| p.kind), "Correlated follow-up reply");
                Ok(Disposition::Resume(Box::new(fresh)))
            }
            Status::InProgress => {
                debug!(thread_id, ticket_id = %fresh.id, "Message on in-flight ticket");
                Ok(Disposition::InFlightUpdate(Box::new(fresh)))
            }
            // Raced with finalization between the two reads.
            _ => Ok(Disposition::NewThread),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;

    use crate::store::LibSqlStore;
    use crate::ticket::{Category, PendingFollowUp, FollowUpKind, Stage, TranscriptEntry};

    async fn setup() -> (Arc<LibSqlStore>, ThreadCorrelator) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let correlator = ThreadCorrelator::new(store.clone());
        (store, correlator)
    }

    fn ticket(id: &str, thread: &str) -> Ticket {
        let mut t = Ticket::new_classified(
            id.into(),
            thread.into(),
            Category::Incident,
            Utc::now(),
        );
        t.record_message(TranscriptEntry {
            message_id: "m1".into(),
            sender: "alice@example.com".into(),
            subject: Some("Help".into()),
            body: "VPN down".into(),
            received_at: Utc::now(),
        });
        t
    }

    #[tokio::test]
    async fn unknown_thread_is_new() {
        let (_, correlator) = setup().await;
        let d = correlator.resolve("thread-x", "m1").await.unwrap();
        assert!(matches!(d, Disposition::NewThread));
    }

    #[tokio::test]
    async fn awaiting_ticket_resumes() {
        let (store, correlator) = setup().await;
        let mut t = ticket("TEMP-FIELDS-20240101-0001", "thread-1");
        t.status = Status::AwaitingResponse;
        t.pending_followup = Some(PendingFollowUp {
            kind: FollowUpKind::Fields,
            requested_at: Utc::now(),
            expected_stage: Stage::Classified,
            reminders_sent: 0,
            note: None,
            last_message_id: None,
        });
        store.put(&t).await.unwrap();

        let d = correlator.resolve("thread-1", "m2").await.unwrap();
        match d {
            Disposition::Resume(found) => assert_eq!(found.id, t.id),
            other => panic!("expected Resume, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stalled_ticket_still_resumes() {
        let (store, correlator) = setup().await;
        let mut t = ticket("TEMP-FIELDS-20240101-0001", "thread-1");
        t.status = Status::Stalled;
        store.put(&t).await.unwrap();

        let d = correlator.resolve("thread-1", "m2").await.unwrap();
        assert!(matches!(d, Disposition::Resume(_)));
    }

    #[tokio::test]
    async fn in_flight_ticket_takes_update() {
        let (store, correlator) = setup().await;
        let t = ticket("TEMP-FIELDS-20240101-0001", "thread-1");
        store.put(&t).await.unwrap();

        let d = correlator.resolve("thread-1", "m2").await.unwrap();
        assert!(matches!(d, Disposition::InFlightUpdate(_)));
    }

    #[tokio::test]
    async fn redelivered_message_is_duplicate() {
        let (store, correlator) = setup().await;
        let t = ticket("TEMP-FIELDS-20240101-0001", "thread-1");
        store.put(&t).await.unwrap();

        let d = correlator.resolve("thread-1", "m1").await.unwrap();
        match d {
            Disposition::Duplicate { ticket_id } => {
                assert_eq!(ticket_id, "TEMP-FIELDS-20240101-0001")
            }
            other => panic!("expected Duplicate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_to_finalized_thread_is_new() {
        let (store, correlator) = setup().await;
        let mut t = ticket("TKT-20240101-0002", "thread-1");
        t.stage = Stage::Finalized;
        t.status = Status::Finalized;
        store.put(&t).await.unwrap();

        let d = correlator.resolve("thread-1", "m9").await.unwrap();
        assert!(matches!(d, Disposition::NewThread));
    }

    #[tokio::test]
    async fn redelivery_on_finalized_thread_is_duplicate() {
        let (store, correlator) = setup().await;
        let mut t = ticket("TKT-20240101-0002", "thread-1");
        t.stage = Stage::Finalized;
        t.status = Status::Finalized;
        store.put(&t).await.unwrap();

        // m1 is already in the finalized ticket's transcript.
        let d = correlator.resolve("thread-1", "m1").await.unwrap();
        assert!(matches!(d, Disposition::Duplicate { .. }));
    }

    #[tokio::test]
    async fn two_active_tickets_is_ambiguous() {
        let (store, correlator) = setup().await;
        store
            .put(&ticket("TEMP-FIELDS-20240101-0001", "thread-1"))
            .await
            .unwrap();
        store
            .put(&ticket("TEMP-FIELDS-20240101-0002", "thread-1"))
            .await
            .unwrap();

        let err = correlator.resolve("thread-1", "m2").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CorrelationAmbiguous { count: 2, .. }
        ));
    }
}
