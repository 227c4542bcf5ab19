//! Scripted capability and mail doubles shared by unit and integration
//! tests. Each double replays a queue of canned outcomes; an exhausted
//! queue keeps returning its last entry so multi-pass scenarios stay short.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::capability::{
    Classification, Classifier, FieldExtraction, FieldExtractor, SubcategoryExtractor,
    SubcategoryGuess,
};
use crate::error::{CapabilityError, MailError};
use crate::mail::{InboundEmail, MailSender};
use crate::ticket::Category;

type Scripted<T> = Mutex<VecDeque<Result<T, String>>>;

fn next_from<T: Clone>(script: &Scripted<T>, name: &str) -> Result<T, CapabilityError> {
    let mut queue = script.lock().unwrap();
    let entry = if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    };
    match entry {
        Some(Ok(value)) => Ok(value),
        Some(Err(reason)) => Err(CapabilityError::Transient(reason)),
        None => Err(CapabilityError::Invalid(format!("{name} script exhausted"))),
    }
}

// ── Capability doubles ──────────────────────────────────────────────

pub struct ScriptedClassifier {
    script: Scripted<Classification>,
    pub calls: Mutex<u32>,
}

impl ScriptedClassifier {
    pub fn returning(label: Category, confidence: f32) -> Self {
        Self::with_script(vec![Ok(Classification {
            label,
            confidence,
            evidence: None,
        })])
    }

    pub fn with_script(script: Vec<Result<Classification, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, _email_text: &str) -> Result<Classification, CapabilityError> {
        *self.calls.lock().unwrap() += 1;
        next_from(&self.script, "classifier")
    }
}

pub struct ScriptedFieldExtractor {
    script: Scripted<FieldExtraction>,
    pub calls: Mutex<u32>,
}

impl ScriptedFieldExtractor {
    pub fn with_script(script: Vec<Result<FieldExtraction, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(0),
        }
    }

    /// One complete, confident extraction.
    pub fn complete(fields: &[(&str, &str)]) -> Self {
        Self::with_script(vec![Ok(extraction(fields, &[], 0.9))])
    }
}

#[async_trait]
impl FieldExtractor for ScriptedFieldExtractor {
    async fn extract_fields(
        &self,
        _email_text: &str,
        _prior_fields: &BTreeMap<String, String>,
    ) -> Result<FieldExtraction, CapabilityError> {
        *self.calls.lock().unwrap() += 1;
        next_from(&self.script, "field extractor")
    }
}

pub struct ScriptedSubcategoryExtractor {
    script: Scripted<SubcategoryGuess>,
    pub calls: Mutex<u32>,
}

impl ScriptedSubcategoryExtractor {
    pub fn with_script(script: Vec<Result<SubcategoryGuess, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(0),
        }
    }

    pub fn confident(subcategory: &str) -> Self {
        Self::with_script(vec![Ok(guess(Some(subcategory), 0.9))])
    }
}

#[async_trait]
impl SubcategoryExtractor for ScriptedSubcategoryExtractor {
    async fn extract_subcategory(
        &self,
        _email_text: &str,
        _category: Category,
    ) -> Result<SubcategoryGuess, CapabilityError> {
        *self.calls.lock().unwrap() += 1;
        next_from(&self.script, "subcategory extractor")
    }
}

// ── Mail double ─────────────────────────────────────────────────────

/// One captured outbound email.
#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub message_id: String,
}

/// Records every send; never touches the network.
#[derive(Default)]
pub struct RecordingMailSender {
    pub sent: Mutex<Vec<SentMail>>,
}

impl RecordingMailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<SentMail> {
        self.sent.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MailSender for RecordingMailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<String, MailError> {
        let mut sent = self.sent.lock().unwrap();
        let message_id = format!("out-{}", sent.len() + 1);
        sent.push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            message_id: message_id.clone(),
        });
        Ok(message_id)
    }
}

// ── Builders ────────────────────────────────────────────────────────

pub fn extraction(fields: &[(&str, &str)], missing: &[&str], confidence: f32) -> FieldExtraction {
    FieldExtraction {
        fields: fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        missing: missing.iter().map(|s| s.to_string()).collect(),
        confidence,
    }
}

pub fn guess(subcategory: Option<&str>, confidence: f32) -> SubcategoryGuess {
    SubcategoryGuess {
        subcategory: subcategory.map(|s| s.to_string()),
        confidence,
    }
}

pub fn inbound(thread_id: &str, message_id: &str, body: &str) -> InboundEmail {
    InboundEmail {
        thread_id: thread_id.to_string(),
        message_id: message_id.to_string(),
        sender: "alice@example.com".to_string(),
        subject: Some("Help".to_string()),
        body: body.to_string(),
        received_at: Utc::now(),
    }
}
