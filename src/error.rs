//! Error types for Maildesk.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Rules error: {0}")]
    Rules(#[from] RulesError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ticket store and counter errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Ticket not found: {id}")]
    NotFound { id: String },

    #[error("Record {id} is {status} and immutable")]
    Immutable { id: String, status: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Durable counter unavailable: {0}")]
    CounterUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Extraction/classification capability errors.
///
/// `Transient` failures are retried with bounded backoff without advancing
/// or regressing ticket state; everything else is permanent for the attempt.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Transient capability failure: {0}")]
    Transient(String),

    #[error("Invalid capability response: {0}")]
    Invalid(String),

    #[error("Capability {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

impl CapabilityError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }
}

/// Outbound mail errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Failed to send to {to}: {reason}")]
    SendFailed { to: String, reason: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Rule table errors (loading only — evaluation never fails).
#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("Failed to parse rule table: {0}")]
    Parse(String),

    #[error("Invalid rule pattern for subcategory {subcategory}: {message}")]
    InvalidPattern {
        subcategory: String,
        message: String,
    },
}

/// Pipeline orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Reply on thread {thread_id} matches {count} active tickets")]
    CorrelationAmbiguous { thread_id: String, count: usize },

    #[error("Ticket {id}: illegal stage transition {from} -> {to}")]
    IllegalTransition { id: String, from: String, to: String },

    #[error("Gave up on concurrent modification of {id} after {attempts} attempts")]
    CasExhausted { id: String, attempts: u32 },

    #[error("Dispatcher is shut down")]
    Shutdown,
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
