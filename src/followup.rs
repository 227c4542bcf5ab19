//! Follow-up orchestration: asking the requester for what the pipeline
//! could not determine, reminding them, and flagging silence.
//!
//! Arming a follow-up is mail-then-CAS: the outbound message goes first,
//! then the durable descriptor lands on the ticket. A crash between the two
//! re-sends the question on replay rather than losing it. The periodic
//! sweep escalates quiet tickets: reminders up to the configured budget,
//! then `Stalled` plus an operator notification. A ticket is never parked
//! silently.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{MailError, PipelineError};
use crate::mail::MailSender;
use crate::pipeline::update_with_cas;
use crate::store::{TicketFilter, TicketStore};
use crate::ticket::{FollowUpKind, PendingFollowUp, Status, Ticket};

/// Outcome counts of one sweep pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub reminders: u32,
    pub stalled: u32,
}

/// Sends follow-up questions and watches for silence.
pub struct FollowUpOrchestrator {
    store: Arc<dyn TicketStore>,
    mail: Arc<dyn MailSender>,
    config: PipelineConfig,
}

impl FollowUpOrchestrator {
    pub fn new(
        store: Arc<dyn TicketStore>,
        mail: Arc<dyn MailSender>,
        config: PipelineConfig,
    ) -> Self {
        Self { store, mail, config }
    }

    /// Ask for `kind` on a ticket and suspend it in `AwaitingResponse`.
    ///
    /// Requester kinds go to the thread's first sender; operator
    /// escalations go to the operator address. Either way the ticket stays
    /// resumable and under the sweep's watch.
    pub async fn request(
        &self,
        ticket: &Ticket,
        kind: FollowUpKind,
        note: Option<String>,
    ) -> Result<Ticket, PipelineError> {
        let to = if kind == FollowUpKind::Operator {
            self.config.operator_address.clone()
        } else {
            ticket
                .requester()
                .ok_or_else(|| MailError::InvalidMessage("ticket has no requester".into()))?
                .to_string()
        };

        let (subject, body) = compose(ticket, kind, note.as_deref());
        let message_id = self.mail.send(&to, &subject, &body).await?;
        info!(ticket_id = %ticket.id, %kind, to, "Follow-up sent");

        let requested_at = Utc::now();
        let written = update_with_cas(&self.store, &ticket.id, self.config.cas_max_retries, |t| {
            t.pending_followup = Some(PendingFollowUp {
                kind,
                requested_at,
                expected_stage: t.stage,
                reminders_sent: 0,
                note: note.clone(),
                last_message_id: Some(message_id.clone()),
            });
            t.status = Status::AwaitingResponse;
            t.updated_at = requested_at;
        })
        .await?;
        Ok(written)
    }

    /// One pass over suspended tickets: remind the quiet ones, stall the
    /// exhausted ones. `now` is a parameter so tests can move the clock.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepStats, PipelineError> {
        let awaiting = self
            .store
            .list(&TicketFilter {
                status: Some(Status::AwaitingResponse),
                ..Default::default()
            })
            .await?;

        let mut stats = SweepStats::default();
        for ticket in awaiting {
            let Some(pending) = ticket.pending_followup.clone() else {
                warn!(ticket_id = %ticket.id, "Awaiting ticket without follow-up descriptor");
                continue;
            };

            // Next action is due one reminder interval after the last send.
            let interval = chrono::Duration::from_std(self.config.reminder_after)
                .unwrap_or_else(|_| chrono::Duration::days(365));
            let due = pending.requested_at
                + interval * i32::try_from(pending.reminders_sent + 1).unwrap_or(i32::MAX);
            if now < due {
                continue;
            }

            if pending.reminders_sent >= self.config.max_reminders {
                if self.stall(&ticket, &pending).await? {
                    stats.stalled += 1;
                }
            } else {
                self.remind(&ticket, &pending).await?;
                stats.reminders += 1;
            }
        }
        Ok(stats)
    }

    async fn remind(&self, ticket: &Ticket, pending: &PendingFollowUp) -> Result<(), PipelineError> {
        let to = if pending.kind == FollowUpKind::Operator {
            Some(self.config.operator_address.clone())
        } else {
            ticket.requester().map(str::to_string)
        };
        let Some(to) = to else {
            return Ok(());
        };
        let (subject, body) = compose_reminder(ticket, pending);
        let message_id = self.mail.send(&to, &subject, &body).await?;
        info!(ticket_id = %ticket.id, reminders = pending.reminders_sent + 1, "Reminder sent");

        update_with_cas(&self.store, &ticket.id, self.config.cas_max_retries, |t| {
            if let Some(p) = t.pending_followup.as_mut() {
                p.reminders_sent += 1;
                p.last_message_id = Some(message_id.clone());
            }
        })
        .await?;
        Ok(())
    }

    /// Returns `false` when a reply won the race and the ticket resumed
    /// between the sweep's listing and this write.
    async fn stall(&self, ticket: &Ticket, pending: &PendingFollowUp) -> Result<bool, PipelineError> {
        let written = update_with_cas(&self.store, &ticket.id, self.config.cas_max_retries, |t| {
            // Only stall while the same follow-up is still armed.
            if t.pending_followup.as_ref() == Some(pending) {
                t.status = Status::Stalled;
            }
        })
        .await?;
        if written.status != Status::Stalled {
            info!(ticket_id = %ticket.id, "Reply arrived mid-sweep, leaving ticket active");
            return Ok(false);
        }

        warn!(
            ticket_id = %ticket.id,
            kind = %pending.kind,
            reminders = pending.reminders_sent,
            "Follow-up exhausted, stalling ticket"
        );

        // Stalled is visible, not silent: tell the operators.
        let subject = format!("[{}] Requester unresponsive", ticket.id);
        let body = format!(
            "Ticket {} has been waiting on a {} follow-up with no reply after {} reminder(s).\n\
             It is now marked stalled. A late reply will still resume it.",
            ticket.id,
            pending.kind,
            pending.reminders_sent,
        );
        self.mail
            .send(&self.config.operator_address, &subject, &body)
            .await?;
        Ok(true)
    }

    /// Spawn the periodic sweep loop. Errors are logged, never fatal.
    pub fn spawn_sweep_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                match self.sweep(Utc::now()).await {
                    Ok(stats) if stats.reminders + stats.stalled > 0 => {
                        info!(reminders = stats.reminders, stalled = stats.stalled, "Sweep pass done");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Follow-up sweep failed"),
                }
            }
        })
    }
}

// ── Message composition ─────────────────────────────────────────────

fn compose(ticket: &Ticket, kind: FollowUpKind, note: Option<&str>) -> (String, String) {
    let subject = format!("[{}] We need a little more information", ticket.id);
    let body = match kind {
        FollowUpKind::Fields => format!(
            "Hello,\n\n\
             Thank you for contacting IT support. To move your request forward we \
             still need the following from you:\n\n{}\n\n\
             Simply reply to this email; your answer will be attached to ticket {}.",
            note.unwrap_or("- some required details are missing"),
            ticket.id,
        ),
        FollowUpKind::Subcategory => format!(
            "Hello,\n\n\
             We could not determine precisely which service your request concerns. \
             Could you describe the problem in a little more detail (what is failing, \
             since when, which application or equipment)?\n\n\
             Reply to this email to update ticket {}.",
            ticket.id,
        ),
        FollowUpKind::SubcategoryConfirmation => format!(
            "Hello,\n\n\
             We understood your request as: {}.\n\
             Please reply to confirm, or correct us if that is wrong.\n\n\
             Your reply will be attached to ticket {}.",
            note.unwrap_or("(unclassified)"),
            ticket.id,
        ),
        FollowUpKind::Priority => format!(
            "Hello,\n\n\
             To assign the right priority to your request we need to know:\n\n{}\n\n\
             Reply to this email to update ticket {}.",
            note.unwrap_or("- the impact of the problem"),
            ticket.id,
        ),
        FollowUpKind::Operator => format!(
            "Automatic processing of ticket {} failed permanently and needs a human.\n\n\
             Thread: {}\nStage: {}\nDetail: {}",
            ticket.id,
            ticket.thread_id,
            ticket.stage,
            note.unwrap_or("(none)"),
        ),
    };
    (subject, body)
}

fn compose_reminder(ticket: &Ticket, pending: &PendingFollowUp) -> (String, String) {
    let subject = format!("[{}] Reminder: we are waiting for your reply", ticket.id);
    let body = format!(
        "Hello,\n\n\
         We are still waiting for the information requested on {} to continue \
         processing ticket {}.\n\n{}\n\n\
         Simply reply to this email.",
        pending.requested_at.format("%Y-%m-%d"),
        ticket.id,
        pending.note.as_deref().unwrap_or(""),
    );
    (subject, body.trim_end().to_string())
}
