//! Extraction capability interfaces.
//!
//! The pipeline talks to classification and extraction through these traits;
//! implementations are interchangeable (LLM-backed in production, scripted
//! mocks in tests). Results carry a confidence score the state machine
//! compares against the configured threshold to decide advance vs. detour.

pub mod llm;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::error::CapabilityError;
use crate::ticket::Category;

// ── Results ─────────────────────────────────────────────────────────

/// Outcome of classifying an inbound email.
#[derive(Debug, Clone)]
pub struct Classification {
    pub label: Category,
    pub confidence: f32,
    /// Short quote or rationale supporting the label.
    pub evidence: Option<String>,
}

/// Outcome of field extraction.
#[derive(Debug, Clone)]
pub struct FieldExtraction {
    /// Attribute name → value for everything found.
    pub fields: BTreeMap<String, String>,
    /// Required fields the text did not provide.
    pub missing: Vec<String>,
    pub confidence: f32,
}

impl FieldExtraction {
    /// Complete and confident enough to advance past field extraction.
    pub fn is_complete(&self, threshold: f32) -> bool {
        self.missing.is_empty() && self.confidence >= threshold
    }
}

/// Outcome of subcategory resolution.
#[derive(Debug, Clone)]
pub struct SubcategoryGuess {
    pub subcategory: Option<String>,
    pub confidence: f32,
}

impl SubcategoryGuess {
    pub fn is_confident(&self, threshold: f32) -> bool {
        self.subcategory.is_some() && self.confidence >= threshold
    }
}

// ── Capability traits ───────────────────────────────────────────────

/// Classifies an email thread as Incident or Demande.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, email_text: &str) -> Result<Classification, CapabilityError>;
}

/// Extracts required ticket fields, given what is already known.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract_fields(
        &self,
        email_text: &str,
        prior_fields: &BTreeMap<String, String>,
    ) -> Result<FieldExtraction, CapabilityError>;
}

/// Resolves the subcategory for a classified email.
#[async_trait]
pub trait SubcategoryExtractor: Send + Sync {
    async fn extract_subcategory(
        &self,
        email_text: &str,
        category: Category,
    ) -> Result<SubcategoryGuess, CapabilityError>;
}

// ── Retry ───────────────────────────────────────────────────────────

/// Bounded exponential backoff for transient capability failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based): base * 2^(attempt-1),
    /// capped, with up to 20% jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..0.2);
        exp.mul_f64(1.0 + jitter)
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is
/// spent. Only transient errors are retried; ticket state is untouched
/// throughout — the caller decides what a permanent failure means.
pub async fn with_retry<T, F, Fut>(
    name: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, CapabilityError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    capability = name,
                    attempt,
                    max = policy.max_attempts,
                    ?delay,
                    error = %e,
                    "Transient capability failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
