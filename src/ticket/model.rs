//! The `Ticket` record and its lifecycle vocabulary.
//!
//! A ticket is created when a brand-new email thread passes classification
//! and advances through the pipeline stages one CAS write at a time. The
//! record carries everything needed to suspend on a follow-up and resume
//! hours or days later: extracted fields, the message transcript, and the
//! pending follow-up descriptor.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Stage ───────────────────────────────────────────────────────────

/// Pipeline stage, in canonical order.
///
/// Transitions advance one step at a time; a follow-up detour keeps the
/// stage unchanged and re-enters it when the reply arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Received,
    Classified,
    FieldsExtracted,
    SubcategoryResolved,
    PriorityResolved,
    Finalized,
}

impl Stage {
    /// The next stage in canonical order, or `None` at the end.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Received => Some(Stage::Classified),
            Stage::Classified => Some(Stage::FieldsExtracted),
            Stage::FieldsExtracted => Some(Stage::SubcategoryResolved),
            Stage::SubcategoryResolved => Some(Stage::PriorityResolved),
            Stage::PriorityResolved => Some(Stage::Finalized),
            Stage::Finalized => None,
        }
    }

    /// Short label for logging and DB columns.
    pub fn label(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Classified => "classified",
            Stage::FieldsExtracted => "fields-extracted",
            Stage::SubcategoryResolved => "subcategory-resolved",
            Stage::PriorityResolved => "priority-resolved",
            Stage::Finalized => "finalized",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Status ──────────────────────────────────────────────────────────

/// Processing status of a ticket record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// Actively moving through the pipeline.
    InProgress,
    /// Suspended on a follow-up; a correlated reply resumes it.
    AwaitingResponse,
    /// Follow-up reminders exhausted — visible to operators, still resumable.
    Stalled,
    /// Terminal: all fields, subcategory, priority and team resolved.
    Finalized,
    /// Retired temp record, replaced by a final ticket. Never deleted.
    Superseded,
    /// Terminal: explicitly abandoned by an operator.
    Abandoned,
}

impl Status {
    /// Terminal/retired statuses reject all further mutation.
    pub fn is_immutable(self) -> bool {
        matches!(self, Status::Finalized | Status::Superseded | Status::Abandoned)
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::InProgress => "in-progress",
            Status::AwaitingResponse => "awaiting-response",
            Status::Stalled => "stalled",
            Status::Finalized => "finalized",
            Status::Superseded => "superseded",
            Status::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Classification / priority ───────────────────────────────────────

/// Top-level classification of an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Incident,
    Demande,
}

impl Category {
    pub fn label(self) -> &'static str {
        match self {
            Category::Incident => "Incident",
            Category::Demande => "Demande",
        }
    }
}

/// Closed priority enumeration, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical,
    Elevated,
    Standard,
}

impl Priority {
    pub fn label(self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::Elevated => "ELEVATED",
            Priority::Standard => "STANDARD",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Follow-ups ──────────────────────────────────────────────────────

/// Which clarification a suspended ticket is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FollowUpKind {
    /// One or more required fields are missing or uncertain.
    Fields,
    /// No subcategory could be resolved with enough confidence.
    Subcategory,
    /// A subcategory was resolved but policy requires explicit confirmation.
    SubcategoryConfirmation,
    /// Priority rules reference information the ticket does not have yet.
    Priority,
    /// Extraction failed permanently — escalated to a human operator.
    Operator,
}

impl FollowUpKind {
    pub fn label(self) -> &'static str {
        match self {
            FollowUpKind::Fields => "fields",
            FollowUpKind::Subcategory => "subcategory",
            FollowUpKind::SubcategoryConfirmation => "subcategory-confirmation",
            FollowUpKind::Priority => "priority",
            FollowUpKind::Operator => "operator",
        }
    }
}

impl std::fmt::Display for FollowUpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Durable descriptor of an armed follow-up watch.
///
/// Lives on the ticket itself so a multi-day suspension survives restarts;
/// the correlator finds it through the thread index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFollowUp {
    pub kind: FollowUpKind,
    pub requested_at: DateTime<Utc>,
    /// Stage to re-enter when the reply correlates.
    pub expected_stage: Stage,
    /// Reminders already re-sent by the sweep.
    pub reminders_sent: u32,
    /// What exactly was asked (missing field names, candidate subcategory…).
    #[serde(default)]
    pub note: Option<String>,
    /// Provider id of the last outbound follow-up message.
    #[serde(default)]
    pub last_message_id: Option<String>,
}

// ── History / transcript ────────────────────────────────────────────

/// One stage transition, for audit and debugging. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
    pub at: DateTime<Utc>,
}

/// One inbound message folded into the ticket's context. Append-only,
/// deduplicated by `message_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub message_id: String,
    pub sender: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

// ── Ticket ──────────────────────────────────────────────────────────

/// The central entity: one support request moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// `TKT-YYYYMMDD-NNNN` (final) or `TEMP-<STAGE>-YYYYMMDD-NNNN`.
    /// Immutable once assigned; never reused.
    pub id: String,
    /// Originating email conversation. At most one non-finalized ticket
    /// per thread at any time.
    pub thread_id: String,
    /// CAS token, bumped on every successful write.
    pub version: u64,
    pub stage: Stage,
    pub status: Status,
    #[serde(default)]
    pub category: Option<Category>,
    /// Extracted attributes. Merge-only — values are never dropped.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub subcategory: Option<String>,
    /// Set once a subcategory-confirmation reply has been folded in.
    #[serde(default)]
    pub subcategory_confirmed: bool,
    /// Set once a priority follow-up has been asked, so the pipeline
    /// defaults instead of asking twice.
    #[serde(default)]
    pub priority_probed: bool,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub pending_followup: Option<PendingFollowUp>,
    /// Every message observed on the thread, in arrival order.
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
    /// Ordered stage transitions with timestamps.
    #[serde(default)]
    pub history: Vec<StageTransition>,
    /// Final ticket id, once this temp record has been retired.
    #[serde(default)]
    pub superseded_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Create a freshly classified ticket for a new thread.
    pub fn new_classified(
        id: String,
        thread_id: String,
        category: Category,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            thread_id,
            version: 1,
            stage: Stage::Classified,
            status: Status::InProgress,
            category: Some(category),
            fields: BTreeMap::new(),
            subcategory: None,
            subcategory_confirmed: false,
            priority_probed: false,
            priority: None,
            team: None,
            pending_followup: None,
            transcript: Vec::new(),
            history: vec![StageTransition {
                from: Stage::Received,
                to: Stage::Classified,
                at: now,
            }],
            superseded_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance to the next canonical stage, recording the transition.
    ///
    /// Returns `false` (and leaves the ticket untouched) if `to` is not the
    /// immediate successor of the current stage.
    pub fn advance_to(&mut self, to: Stage, now: DateTime<Utc>) -> bool {
        if self.stage.next() != Some(to) {
            return false;
        }
        self.history.push(StageTransition {
            from: self.stage,
            to,
            at: now,
        });
        self.stage = to;
        self.updated_at = now;
        true
    }

    /// Merge newly extracted fields. Existing values win over re-extractions
    /// so already-confirmed data is never lost.
    pub fn merge_fields(&mut self, extracted: &BTreeMap<String, String>) {
        for (k, v) in extracted {
            if v.trim().is_empty() {
                continue;
            }
            self.fields.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    /// Whether a message id has already been folded into this ticket.
    pub fn has_seen_message(&self, message_id: &str) -> bool {
        self.transcript.iter().any(|e| e.message_id == message_id)
    }

    /// Append a message to the transcript. Returns `false` on duplicates.
    pub fn record_message(&mut self, entry: TranscriptEntry) -> bool {
        if self.has_seen_message(&entry.message_id) {
            return false;
        }
        self.transcript.push(entry);
        true
    }

    /// Full thread text fed to extraction capabilities: every message so
    /// far, in order, with sender and subject headers.
    pub fn thread_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.transcript {
            out.push_str(&format!("--- Message from {} ---\n", entry.sender));
            if let Some(ref subject) = entry.subject {
                out.push_str(&format!("Subject: {}\n", subject));
            }
            out.push_str(&entry.body);
            out.push_str("\n\n");
        }
        out
    }

    /// Sender address of the first message on the thread (the requester).
    pub fn requester(&self) -> Option<&str> {
        self.transcript.first().map(|e| e.sender.as_str())
    }

    /// Validate that `history` is a legal walk of the stage graph:
    /// each hop advances exactly one stage and hops chain head-to-tail.
    pub fn history_is_ordered(&self) -> bool {
        let mut cursor = Stage::Received;
        for t in &self.history {
            if t.from != cursor || cursor.next() != Some(t.to) {
                return false;
            }
            cursor = t.to;
        }
        cursor == self.stage || self.status == Status::Superseded
    }
}
