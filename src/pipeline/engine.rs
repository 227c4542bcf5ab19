//! The pipeline state machine.
//!
//! One inbound email becomes exactly one pass through `handle`: the
//! correlator decides what the message means, then `run` drives the ticket
//! stage by stage until it finalizes, suspends on a follow-up, or escalates
//! to an operator. Every ticket mutation goes through compare-and-swap;
//! side effects (mail, id draws) happen outside the CAS closures so a lost
//! race never repeats them.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::capability::{Classifier, FieldExtractor, SubcategoryExtractor, with_retry};
use crate::config::PipelineConfig;
use crate::correlate::{Disposition, ThreadCorrelator};
use crate::error::{CapabilityError, PipelineError};
use crate::followup::FollowUpOrchestrator;
use crate::idgen::IdGenerator;
use crate::mail::{InboundEmail, MailSender};
use crate::pipeline::update_with_cas;
use crate::rules::RulesEngine;
use crate::store::TicketStore;
use crate::ticket::{
    FollowUpKind, Stage, StageTransition, Status, Ticket, TranscriptEntry,
};

/// Stage token used in temporary ids: the first work a new ticket waits on.
const TEMP_STAGE_TOKEN: &str = "FIELDS";

/// How one inbound message ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The ticket reached the end of the pipeline; `ticket_id` is final.
    Finalized { ticket_id: String },
    /// Suspended on a follow-up question to the requester.
    Suspended { ticket_id: String, kind: FollowUpKind },
    /// Extraction failed permanently; handed to an operator.
    Escalated { ticket_id: String },
    /// Redelivery of a message already folded into the ticket.
    Duplicate { ticket_id: String },
}

enum Control {
    Continue(Ticket),
    Stop(Outcome),
}

/// Drives tickets through the stage graph.
pub struct PipelineEngine {
    store: Arc<dyn TicketStore>,
    idgen: IdGenerator,
    correlator: ThreadCorrelator,
    classifier: Arc<dyn Classifier>,
    field_extractor: Arc<dyn FieldExtractor>,
    subcategory_extractor: Arc<dyn SubcategoryExtractor>,
    rules: Arc<RulesEngine>,
    followups: Arc<FollowUpOrchestrator>,
    config: PipelineConfig,
}

impl PipelineEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TicketStore>,
        classifier: Arc<dyn Classifier>,
        field_extractor: Arc<dyn FieldExtractor>,
        subcategory_extractor: Arc<dyn SubcategoryExtractor>,
        rules: Arc<RulesEngine>,
        mail: Arc<dyn MailSender>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            idgen: IdGenerator::new(store.clone()),
            correlator: ThreadCorrelator::new(store.clone()),
            followups: Arc::new(FollowUpOrchestrator::new(
                store.clone(),
                mail,
                config.clone(),
            )),
            store,
            classifier,
            field_extractor,
            subcategory_extractor,
            rules,
            config,
        }
    }

    /// The follow-up orchestrator (shared so a sweep task can be spawned).
    pub fn followups(&self) -> Arc<FollowUpOrchestrator> {
        self.followups.clone()
    }

    /// Process one inbound email end to end.
    pub async fn handle(&self, email: InboundEmail) -> Result<Outcome, PipelineError> {
        match self
            .correlator
            .resolve(&email.thread_id, &email.message_id)
            .await?
        {
            Disposition::NewThread => self.start(email).await,
            Disposition::Resume(ticket) => self.resume(*ticket, email).await,
            Disposition::InFlightUpdate(ticket) => self.fold_and_run(*ticket, email).await,
            Disposition::Duplicate { ticket_id } => {
                info!(ticket_id, message_id = %email.message_id, "Dropping duplicate delivery");
                Ok(Outcome::Duplicate { ticket_id })
            }
        }
    }

    // ── Entry paths ─────────────────────────────────────────────────

    /// New thread: classify, draw a temporary id, persist, run.
    async fn start(&self, email: InboundEmail) -> Result<Outcome, PipelineError> {
        let text = match &email.subject {
            Some(subject) => format!("Subject: {subject}\n\n{}", email.body),
            None => email.body.clone(),
        };
        // No ticket exists yet, so a permanent classification failure has
        // nothing to escalate on; it surfaces to the dispatcher instead.
        let classification = with_retry("classify", &self.config.retry, || {
            self.classifier.classify(&text)
        })
        .await?;

        let now = Utc::now();
        let temp_id = self
            .idgen
            .next_temp_id(TEMP_STAGE_TOKEN, now.date_naive())
            .await?;

        let mut ticket = Ticket::new_classified(
            temp_id,
            email.thread_id.clone(),
            classification.label,
            now,
        );
        ticket.record_message(transcript_entry(&email));
        self.store.put(&ticket).await?;
        info!(
            ticket_id = %ticket.id,
            thread_id = %ticket.thread_id,
            category = classification.label.label(),
            confidence = classification.confidence,
            "Ticket opened"
        );

        self.run(ticket).await
    }

    /// Awaited reply: fold it in, apply the follow-up's effect, re-enter
    /// the suspended stage.
    async fn resume(&self, ticket: Ticket, email: InboundEmail) -> Result<Outcome, PipelineError> {
        let kind = ticket.pending_followup.as_ref().map(|p| p.kind);
        info!(ticket_id = %ticket.id, ?kind, message_id = %email.message_id, "Follow-up reply correlated");

        let entry = transcript_entry(&email);
        let ticket = update_with_cas(&self.store, &ticket.id, self.config.cas_max_retries, |t| {
            t.record_message(entry.clone());
            // A reply to a confirmation request counts as confirmation; a
            // correction still lands in the transcript for re-extraction.
            if kind == Some(FollowUpKind::SubcategoryConfirmation) {
                t.subcategory_confirmed = true;
            }
            t.pending_followup = None;
            t.status = Status::InProgress;
            t.updated_at = entry.received_at;
        })
        .await?;

        // A priority detour asked for rule inputs; pull them out of the
        // reply before the rules run again.
        let ticket = if kind == Some(FollowUpKind::Priority) {
            self.extract_and_merge(ticket).await?
        } else {
            ticket
        };

        self.run(ticket).await
    }

    /// Extra message on an in-flight ticket: fold it in and drive the
    /// ticket forward (also recovers tickets a crash left in-progress).
    async fn fold_and_run(
        &self,
        ticket: Ticket,
        email: InboundEmail,
    ) -> Result<Outcome, PipelineError> {
        let entry = transcript_entry(&email);
        let ticket = update_with_cas(&self.store, &ticket.id, self.config.cas_max_retries, |t| {
            t.record_message(entry.clone());
            t.updated_at = entry.received_at;
        })
        .await?;
        self.run(ticket).await
    }

    // ── The stage loop ──────────────────────────────────────────────

    async fn run(&self, mut ticket: Ticket) -> Result<Outcome, PipelineError> {
        loop {
            let step = match ticket.stage {
                Stage::Classified => self.step_fields(ticket).await?,
                Stage::FieldsExtracted => self.step_subcategory(ticket).await?,
                Stage::SubcategoryResolved => self.step_priority(ticket).await?,
                Stage::PriorityResolved => {
                    let final_id = self.finalize(&ticket).await?;
                    return Ok(Outcome::Finalized { ticket_id: final_id });
                }
                // Received never persists and Finalized never re-enters.
                other => {
                    return Err(PipelineError::IllegalTransition {
                        id: ticket.id,
                        from: other.label().to_string(),
                        to: "(run)".to_string(),
                    });
                }
            };
            match step {
                Control::Continue(next) => ticket = next,
                Control::Stop(outcome) => return Ok(outcome),
            }
        }
    }

    /// Classified → FieldsExtracted, or a `fields` detour.
    async fn step_fields(&self, ticket: Ticket) -> Result<Control, PipelineError> {
        let text = ticket.thread_text();
        let extracted = with_retry("extract_fields", &self.config.retry, || {
            self.field_extractor.extract_fields(&text, &ticket.fields)
        })
        .await;
        let extraction = match extracted {
            Ok(extraction) => extraction,
            Err(e) => return self.escalate(ticket, e).await.map(Control::Stop),
        };

        let complete = extraction.is_complete(self.config.confidence_threshold);
        let fields = extraction.fields.clone();
        let ticket = self
            .advance_if(ticket, complete, Stage::FieldsExtracted, move |t| {
                t.merge_fields(&fields);
            })
            .await?;

        if complete {
            return Ok(Control::Continue(ticket));
        }

        let note = if extraction.missing.is_empty() {
            None
        } else {
            Some(
                extraction
                    .missing
                    .iter()
                    .map(|f| format!("- {f}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        };
        let suspended = self
            .followups
            .request(&ticket, FollowUpKind::Fields, note)
            .await?;
        Ok(Control::Stop(Outcome::Suspended {
            ticket_id: suspended.id,
            kind: FollowUpKind::Fields,
        }))
    }

    /// FieldsExtracted → SubcategoryResolved, or a subcategory /
    /// confirmation detour.
    async fn step_subcategory(&self, ticket: Ticket) -> Result<Control, PipelineError> {
        // Already resolved (e.g. on a resume pass): only the confirmation
        // gate remains.
        if ticket.subcategory.is_none() {
            let text = ticket.thread_text();
            let category = ticket.category.unwrap_or(crate::ticket::Category::Incident);
            let guessed = with_retry("extract_subcategory", &self.config.retry, || {
                self.subcategory_extractor.extract_subcategory(&text, category)
            })
            .await;
            let guess = match guessed {
                Ok(guess) => guess,
                Err(e) => return self.escalate(ticket, e).await.map(Control::Stop),
            };

            if !guess.is_confident(self.config.confidence_threshold) {
                let suspended = self
                    .followups
                    .request(&ticket, FollowUpKind::Subcategory, None)
                    .await?;
                return Ok(Control::Stop(Outcome::Suspended {
                    ticket_id: suspended.id,
                    kind: FollowUpKind::Subcategory,
                }));
            }

            let resolved = guess.subcategory.clone();
            let ticket = update_with_cas(&self.store, &ticket.id, self.config.cas_max_retries, |t| {
                t.subcategory = resolved.clone();
            })
            .await?;
            return self.confirm_or_advance(ticket).await;
        }

        self.confirm_or_advance(ticket).await
    }

    /// Apply the confirmation policy to a ticket whose subcategory is set.
    async fn confirm_or_advance(&self, ticket: Ticket) -> Result<Control, PipelineError> {
        if self.config.require_subcategory_confirmation && !ticket.subcategory_confirmed {
            let note = ticket.subcategory.clone();
            let suspended = self
                .followups
                .request(&ticket, FollowUpKind::SubcategoryConfirmation, note)
                .await?;
            return Ok(Control::Stop(Outcome::Suspended {
                ticket_id: suspended.id,
                kind: FollowUpKind::SubcategoryConfirmation,
            }));
        }
        let ticket = self
            .advance_if(ticket, true, Stage::SubcategoryResolved, |_| {})
            .await?;
        Ok(Control::Continue(ticket))
    }

    /// SubcategoryResolved → PriorityResolved, with at most one `priority`
    /// detour when the rules read fields the ticket does not have.
    async fn step_priority(&self, ticket: Ticket) -> Result<Control, PipelineError> {
        let missing = self
            .rules
            .missing_inputs(ticket.subcategory.as_deref(), &ticket.fields);

        if !missing.is_empty() && !ticket.priority_probed {
            let ticket = update_with_cas(&self.store, &ticket.id, self.config.cas_max_retries, |t| {
                t.priority_probed = true;
            })
            .await?;
            let note = missing
                .iter()
                .map(|f| format!("- {f}"))
                .collect::<Vec<_>>()
                .join("\n");
            let suspended = self
                .followups
                .request(&ticket, FollowUpKind::Priority, Some(note))
                .await?;
            return Ok(Control::Stop(Outcome::Suspended {
                ticket_id: suspended.id,
                kind: FollowUpKind::Priority,
            }));
        }

        let assignment = self
            .rules
            .evaluate(ticket.subcategory.as_deref(), &ticket.fields);
        if assignment.coverage_gap {
            warn!(ticket_id = %ticket.id, subcategory = ?ticket.subcategory, "Rule coverage gap, defaults applied");
        }
        let ticket = self
            .advance_if(ticket, true, Stage::PriorityResolved, move |t| {
                t.priority = Some(assignment.priority);
                t.team = Some(assignment.team.clone());
            })
            .await?;
        Ok(Control::Continue(ticket))
    }

    /// PriorityResolved → Finalized: reserve the final id on the temp
    /// record, write the final record, then retire the temp. Returns the
    /// final ticket id.
    ///
    /// The reservation CAS is the serialization point: concurrent
    /// finalizers all race on `superseded_by`, exactly one id ever lands
    /// there, and every loser or replay adopts it. A draw that loses the
    /// race burns a number but never mints a second final ticket. Each
    /// later step is idempotent against the reserved id, so a crash at any
    /// point replays cleanly.
    async fn finalize(&self, ticket: &Ticket) -> Result<String, PipelineError> {
        let now = Utc::now();

        let current = self
            .store
            .get(&ticket.id)
            .await?
            .ok_or_else(|| crate::error::StoreError::NotFound {
                id: ticket.id.clone(),
            })?;

        let reserved = match current.superseded_by {
            Some(_) => current,
            None => {
                let drawn = self.idgen.next_final_id(now.date_naive()).await?;
                let written =
                    update_with_cas(&self.store, &ticket.id, self.config.cas_max_retries, |t| {
                        if t.superseded_by.is_none() {
                            t.superseded_by = Some(drawn.clone());
                        }
                    })
                    .await;
                match written {
                    Ok(t) => t,
                    // A concurrent finalizer retired the record already;
                    // its reservation is on the fresh copy.
                    Err(PipelineError::Store(crate::error::StoreError::Immutable { .. })) => self
                        .store
                        .get(&ticket.id)
                        .await?
                        .ok_or_else(|| crate::error::StoreError::NotFound {
                            id: ticket.id.clone(),
                        })?,
                    Err(e) => return Err(e),
                }
            }
        };
        let final_id = reserved.superseded_by.clone().ok_or_else(|| {
            crate::error::StoreError::Constraint(format!(
                "record {} is terminal without a final id",
                ticket.id
            ))
        })?;

        // `put` is an upsert keyed by the reserved id, so racing replays
        // converge on one record instead of minting another.
        if self.store.get(&final_id).await?.is_none() {
            let mut final_ticket = reserved.clone();
            final_ticket.id = final_id.clone();
            final_ticket.version = 1;
            final_ticket.status = Status::Finalized;
            final_ticket.pending_followup = None;
            final_ticket.superseded_by = None;
            final_ticket.history.push(StageTransition {
                from: Stage::PriorityResolved,
                to: Stage::Finalized,
                at: now,
            });
            final_ticket.stage = Stage::Finalized;
            final_ticket.updated_at = now;
            self.store.put(&final_ticket).await?;
        }

        let retired = update_with_cas(&self.store, &ticket.id, self.config.cas_max_retries, |t| {
            t.status = Status::Superseded;
            t.pending_followup = None;
            t.updated_at = now;
        })
        .await;
        match retired {
            Ok(_) => {}
            // Another finalizer got there first.
            Err(PipelineError::Store(crate::error::StoreError::Immutable { .. })) => {}
            Err(e) => return Err(e),
        }

        info!(
            ticket_id = %final_id,
            temp_id = %ticket.id,
            priority = ?ticket.priority,
            team = ?ticket.team,
            "Ticket finalized"
        );
        Ok(final_id)
    }

    // ── Operator overrides ──────────────────────────────────────────

    /// Operator decision: finalize now with whatever the ticket has,
    /// defaulting priority and team through the rules.
    pub async fn force_finalize(&self, id: &str) -> Result<String, PipelineError> {
        let ticket = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| crate::error::StoreError::NotFound { id: id.to_string() })?;

        let assignment = self
            .rules
            .evaluate(ticket.subcategory.as_deref(), &ticket.fields);
        let walked = update_with_cas(&self.store, id, self.config.cas_max_retries, |t| {
            let now = Utc::now();
            t.status = Status::InProgress;
            t.pending_followup = None;
            while t.stage != Stage::PriorityResolved {
                let Some(next) = t.stage.next() else { break };
                t.advance_to(next, now);
            }
            if t.priority.is_none() {
                t.priority = Some(assignment.priority);
            }
            if t.team.is_none() {
                t.team = Some(assignment.team.clone());
            }
        })
        .await;
        let ticket = match walked {
            Ok(t) => t,
            // A concurrent finalizer retired the record; adopt its result.
            Err(PipelineError::Store(crate::error::StoreError::Immutable { .. })) => {
                let t = self
                    .store
                    .get(id)
                    .await?
                    .ok_or_else(|| crate::error::StoreError::NotFound { id: id.to_string() })?;
                if let Some(final_id) = t.superseded_by {
                    return Ok(final_id);
                }
                return Err(crate::error::StoreError::Immutable {
                    id: t.id,
                    status: t.status.label().to_string(),
                }
                .into());
            }
            Err(e) => return Err(e),
        };

        self.finalize(&ticket).await
    }

    /// Operator decision: abandon the ticket. Terminal.
    pub async fn force_abandon(&self, id: &str, reason: &str) -> Result<(), PipelineError> {
        warn!(ticket_id = id, reason, "Ticket abandoned by operator");
        update_with_cas(&self.store, id, self.config.cas_max_retries, |t| {
            t.status = Status::Abandoned;
            t.pending_followup = None;
            t.updated_at = Utc::now();
        })
        .await?;
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// One CAS write applying `mutate` and, when `advance` is set, the
    /// stage transition to `to`. Errors if the transition is illegal.
    async fn advance_if<F>(
        &self,
        ticket: Ticket,
        advance: bool,
        to: Stage,
        mutate: F,
    ) -> Result<Ticket, PipelineError>
    where
        F: Fn(&mut Ticket),
    {
        let from = ticket.stage;
        let written = update_with_cas(&self.store, &ticket.id, self.config.cas_max_retries, |t| {
            mutate(t);
            if advance {
                t.advance_to(to, Utc::now());
            }
        })
        .await?;
        if advance && written.stage != to {
            return Err(PipelineError::IllegalTransition {
                id: written.id,
                from: from.label().to_string(),
                to: to.label().to_string(),
            });
        }
        Ok(written)
    }

    /// Run field extraction once and merge the result. Used on priority
    /// detour resumes; extraction failures here are escalated like any
    /// other stage failure.
    async fn extract_and_merge(&self, ticket: Ticket) -> Result<Ticket, PipelineError> {
        let text = ticket.thread_text();
        let extracted = with_retry("extract_fields", &self.config.retry, || {
            self.field_extractor.extract_fields(&text, &ticket.fields)
        })
        .await;
        match extracted {
            Ok(extraction) => {
                let fields = extraction.fields;
                update_with_cas(&self.store, &ticket.id, self.config.cas_max_retries, |t| {
                    t.merge_fields(&fields);
                })
                .await
            }
            Err(e) => {
                warn!(ticket_id = %ticket.id, error = %e, "Reply extraction failed, evaluating with known fields");
                Ok(ticket)
            }
        }
    }

    /// Permanent capability failure: park the ticket with an operator.
    async fn escalate(
        &self,
        ticket: Ticket,
        error: CapabilityError,
    ) -> Result<Outcome, PipelineError> {
        warn!(ticket_id = %ticket.id, stage = %ticket.stage, error = %error, "Capability failed permanently, escalating");
        let written = self
            .followups
            .request(&ticket, FollowUpKind::Operator, Some(error.to_string()))
            .await?;
        Ok(Outcome::Escalated {
            ticket_id: written.id,
        })
    }
}

fn transcript_entry(email: &InboundEmail) -> TranscriptEntry {
    TranscriptEntry {
        message_id: email.message_id.clone(),
        sender: email.sender.clone(),
        subject: email.subject.clone(),
        body: email.body.clone(),
        received_at: email.received_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::store::LibSqlStore;
    use crate::testing::{
        RecordingMailSender, ScriptedClassifier, ScriptedFieldExtractor,
        ScriptedSubcategoryExtractor, extraction, inbound,
    };
    use crate::ticket::{Category, Priority};

    struct Harness {
        store: Arc<LibSqlStore>,
        mail: Arc<RecordingMailSender>,
        engine: PipelineEngine,
    }

    async fn harness(
        classifier: ScriptedClassifier,
        fields: ScriptedFieldExtractor,
        subcategory: ScriptedSubcategoryExtractor,
        config: PipelineConfig,
    ) -> Harness {
        let store: Arc<LibSqlStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let mail = Arc::new(RecordingMailSender::new());
        let engine = PipelineEngine::new(
            store.clone(),
            Arc::new(classifier),
            Arc::new(fields),
            Arc::new(subcategory),
            Arc::new(RulesEngine::default_rules()),
            mail.clone(),
            config,
        );
        Harness { store, mail, engine }
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            retry: crate::capability::RetryPolicy {
                max_attempts: 2,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(2),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn clean_email_finalizes_in_one_pass() {
        let h = harness(
            ScriptedClassifier::returning(Category::Incident, 0.95),
            ScriptedFieldExtractor::complete(&[
                ("name", "Alice"),
                ("impact", "production"),
            ]),
            ScriptedSubcategoryExtractor::confident("reseau"),
            fast_config(),
        )
        .await;

        let outcome = h.engine.handle(inbound("t1", "m1", "tout le site est en panne")).await.unwrap();
        let Outcome::Finalized { ticket_id } = outcome else {
            panic!("expected Finalized, got {outcome:?}");
        };
        assert!(ticket_id.starts_with("TKT-"));

        let final_ticket = h.store.get(&ticket_id).await.unwrap().unwrap();
        assert_eq!(final_ticket.status, Status::Finalized);
        assert_eq!(final_ticket.priority, Some(Priority::Critical));
        assert_eq!(final_ticket.team.as_deref(), Some("network-ops"));
        assert!(final_ticket.history_is_ordered());

        // The temp record is retired, not deleted, and points forward.
        let all = h.store.find_by_thread("t1").await.unwrap();
        assert_eq!(all.len(), 1, "superseded records drop out of thread lookup");
        assert_eq!(all[0].id, ticket_id);

        // No follow-up mail went out.
        assert_eq!(h.mail.sent_count(), 0);
    }

    #[tokio::test]
    async fn missing_fields_suspend_with_a_question() {
        let h = harness(
            ScriptedClassifier::returning(Category::Incident, 0.95),
            ScriptedFieldExtractor::with_script(vec![Ok(extraction(
                &[("name", "Alice")],
                &["impact"],
                0.9,
            ))]),
            ScriptedSubcategoryExtractor::confident("reseau"),
            fast_config(),
        )
        .await;

        let outcome = h.engine.handle(inbound("t1", "m1", "le reseau est lent")).await.unwrap();
        let Outcome::Suspended { ticket_id, kind } = outcome else {
            panic!("expected Suspended, got {outcome:?}");
        };
        assert_eq!(kind, FollowUpKind::Fields);
        assert!(ticket_id.starts_with("TEMP-FIELDS-"));

        let t = h.store.get(&ticket_id).await.unwrap().unwrap();
        assert_eq!(t.status, Status::AwaitingResponse);
        assert_eq!(t.stage, Stage::Classified);
        assert_eq!(t.fields["name"], "Alice");
        assert!(h.mail.last().unwrap().body.contains("impact"));
    }

    #[tokio::test]
    async fn reply_resumes_and_finalizes() {
        let h = harness(
            ScriptedClassifier::returning(Category::Incident, 0.95),
            ScriptedFieldExtractor::with_script(vec![
                Ok(extraction(&[("name", "Alice")], &["impact"], 0.9)),
                Ok(extraction(
                    &[("name", "Alice"), ("impact", "un seul poste")],
                    &[],
                    0.9,
                )),
            ]),
            ScriptedSubcategoryExtractor::confident("reseau"),
            fast_config(),
        )
        .await;

        let first = h.engine.handle(inbound("t1", "m1", "probleme reseau")).await.unwrap();
        assert!(matches!(first, Outcome::Suspended { .. }));

        let second = h
            .engine
            .handle(inbound("t1", "m2", "un seul poste est touche"))
            .await
            .unwrap();
        let Outcome::Finalized { ticket_id } = second else {
            panic!("expected Finalized, got {second:?}");
        };
        let t = h.store.get(&ticket_id).await.unwrap().unwrap();
        assert_eq!(t.priority, Some(Priority::Elevated));
        assert_eq!(t.transcript.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_dropped() {
        let h = harness(
            ScriptedClassifier::returning(Category::Incident, 0.95),
            ScriptedFieldExtractor::with_script(vec![Ok(extraction(&[], &["impact"], 0.9))]),
            ScriptedSubcategoryExtractor::confident("reseau"),
            fast_config(),
        )
        .await;

        h.engine.handle(inbound("t1", "m1", "panne")).await.unwrap();
        let mails = h.mail.sent_count();

        let replay = h.engine.handle(inbound("t1", "m1", "panne")).await.unwrap();
        assert!(matches!(replay, Outcome::Duplicate { .. }));
        assert_eq!(h.mail.sent_count(), mails, "no second follow-up on replay");
    }

    #[tokio::test]
    async fn unconfident_subcategory_asks_for_detail() {
        let h = harness(
            ScriptedClassifier::returning(Category::Incident, 0.95),
            ScriptedFieldExtractor::complete(&[("impact", "production")]),
            ScriptedSubcategoryExtractor::with_script(vec![Ok(crate::testing::guess(None, 0.2))]),
            fast_config(),
        )
        .await;

        let outcome = h.engine.handle(inbound("t1", "m1", "rien ne marche")).await.unwrap();
        let Outcome::Suspended { kind, .. } = outcome else {
            panic!("expected Suspended, got {outcome:?}");
        };
        assert_eq!(kind, FollowUpKind::Subcategory);
    }

    #[tokio::test]
    async fn confirmation_policy_asks_then_advances_on_reply() {
        let mut config = fast_config();
        config.require_subcategory_confirmation = true;
        let h = harness(
            ScriptedClassifier::returning(Category::Incident, 0.95),
            ScriptedFieldExtractor::complete(&[("impact", "production")]),
            ScriptedSubcategoryExtractor::confident("reseau"),
            config,
        )
        .await;

        let first = h.engine.handle(inbound("t1", "m1", "le reseau est mort")).await.unwrap();
        let Outcome::Suspended { ticket_id, kind } = first else {
            panic!("expected Suspended, got {first:?}");
        };
        assert_eq!(kind, FollowUpKind::SubcategoryConfirmation);
        assert!(h.mail.last().unwrap().body.contains("reseau"));

        let second = h.engine.handle(inbound("t1", "m2", "oui c'est bien ca")).await.unwrap();
        assert!(matches!(second, Outcome::Finalized { .. }));

        let temp = h.store.get(&ticket_id).await.unwrap().unwrap();
        assert!(temp.subcategory_confirmed);
        assert_eq!(temp.status, Status::Superseded);
    }

    #[tokio::test]
    async fn priority_detour_asks_once_then_defaults() {
        let h = harness(
            ScriptedClassifier::returning(Category::Incident, 0.95),
            // Never yields the `impact` field the reseau rules read.
            ScriptedFieldExtractor::complete(&[("name", "Alice")]),
            ScriptedSubcategoryExtractor::confident("reseau"),
            fast_config(),
        )
        .await;

        let first = h.engine.handle(inbound("t1", "m1", "souci reseau")).await.unwrap();
        let Outcome::Suspended { ticket_id, kind } = first else {
            panic!("expected Suspended, got {first:?}");
        };
        assert_eq!(kind, FollowUpKind::Priority);
        let t = h.store.get(&ticket_id).await.unwrap().unwrap();
        assert!(t.priority_probed);

        // The reply still does not answer; defaults apply, no second probe.
        let second = h.engine.handle(inbound("t1", "m2", "je ne sais pas")).await.unwrap();
        let Outcome::Finalized { ticket_id } = second else {
            panic!("expected Finalized, got {second:?}");
        };
        let t = h.store.get(&ticket_id).await.unwrap().unwrap();
        assert_eq!(t.priority, Some(Priority::Standard));
        assert_eq!(t.team.as_deref(), Some(RulesEngine::default_team(Priority::Standard)));
    }

    #[tokio::test]
    async fn permanent_extraction_failure_escalates() {
        let h = harness(
            ScriptedClassifier::returning(Category::Incident, 0.95),
            ScriptedFieldExtractor::with_script(vec![
                Err("llm down".into()),
                Err("llm down".into()),
            ]),
            ScriptedSubcategoryExtractor::confident("reseau"),
            fast_config(),
        )
        .await;

        let outcome = h.engine.handle(inbound("t1", "m1", "panne")).await.unwrap();
        let Outcome::Escalated { ticket_id } = outcome else {
            panic!("expected Escalated, got {outcome:?}");
        };
        let t = h.store.get(&ticket_id).await.unwrap().unwrap();
        assert_eq!(t.status, Status::AwaitingResponse);
        assert_eq!(t.pending_followup.unwrap().kind, FollowUpKind::Operator);
        assert_eq!(h.mail.last().unwrap().to, PipelineConfig::default().operator_address);
    }

    #[tokio::test]
    async fn force_finalize_fills_defaults() {
        let h = harness(
            ScriptedClassifier::returning(Category::Demande, 0.95),
            ScriptedFieldExtractor::with_script(vec![Ok(extraction(&[], &["email"], 0.9))]),
            ScriptedSubcategoryExtractor::confident("reseau"),
            fast_config(),
        )
        .await;

        let first = h.engine.handle(inbound("t1", "m1", "besoin d'un acces")).await.unwrap();
        let Outcome::Suspended { ticket_id, .. } = first else {
            panic!("expected Suspended, got {first:?}");
        };

        let final_id = h.engine.force_finalize(&ticket_id).await.unwrap();
        let t = h.store.get(&final_id).await.unwrap().unwrap();
        assert_eq!(t.status, Status::Finalized);
        assert!(t.priority.is_some());
        assert!(t.team.is_some());

        let temp = h.store.get(&ticket_id).await.unwrap().unwrap();
        assert_eq!(temp.superseded_by.as_deref(), Some(final_id.as_str()));
    }

    #[tokio::test]
    async fn force_abandon_is_terminal() {
        let h = harness(
            ScriptedClassifier::returning(Category::Incident, 0.95),
            ScriptedFieldExtractor::with_script(vec![Ok(extraction(&[], &["impact"], 0.9))]),
            ScriptedSubcategoryExtractor::confident("reseau"),
            fast_config(),
        )
        .await;

        let first = h.engine.handle(inbound("t1", "m1", "panne")).await.unwrap();
        let Outcome::Suspended { ticket_id, .. } = first else {
            panic!("expected Suspended, got {first:?}");
        };

        h.engine.force_abandon(&ticket_id, "spam").await.unwrap();
        let t = h.store.get(&ticket_id).await.unwrap().unwrap();
        assert_eq!(t.status, Status::Abandoned);

        // A later message on the thread opens a fresh ticket.
        let next = h.engine.handle(inbound("t1", "m9", "re-panne")).await.unwrap();
        match next {
            Outcome::Suspended { ticket_id: new_id, .. } => assert_ne!(new_id, ticket_id),
            other => panic!("expected a new suspended ticket, got {other:?}"),
        }
    }
}
