//! Pipeline configuration, built from environment variables.

use std::time::Duration;

use crate::capability::RetryPolicy;
use crate::error::ConfigError;

/// Tunables for the pipeline state machine and follow-up orchestration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum capability confidence to advance without a detour.
    pub confidence_threshold: f32,
    /// Ask the requester to confirm a resolved subcategory before advancing.
    pub require_subcategory_confirmation: bool,
    /// Backoff policy for transient capability failures.
    pub retry: RetryPolicy,
    /// Re-read-and-retry budget for lost CAS races.
    pub cas_max_retries: u32,
    /// Quiet time on a suspended ticket before the sweep re-sends a reminder.
    pub reminder_after: Duration,
    /// Reminders before a suspended ticket is marked stalled.
    pub max_reminders: u32,
    /// Interval between follow-up sweep passes.
    pub sweep_interval: Duration,
    /// Where operator escalations are sent.
    pub operator_address: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            require_subcategory_confirmation: false,
            retry: RetryPolicy::default(),
            cas_max_retries: 5,
            reminder_after: Duration::from_secs(24 * 60 * 60),
            max_reminders: 2,
            sweep_interval: Duration::from_secs(15 * 60),
            operator_address: "support-ops@localhost".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Build from environment, falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("CONFIDENCE_THRESHOLD") {
            let value: f32 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "CONFIDENCE_THRESHOLD".into(),
                message: format!("not a number: {raw}"),
            })?;
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: "CONFIDENCE_THRESHOLD".into(),
                    message: format!("out of range [0,1]: {value}"),
                });
            }
            config.confidence_threshold = value;
        }

        if let Ok(raw) = std::env::var("REQUIRE_SUBCATEGORY_CONFIRMATION") {
            config.require_subcategory_confirmation =
                matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Some(secs) = env_u64("REMINDER_AFTER_SECS")? {
            config.reminder_after = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("MAX_REMINDERS")? {
            config.max_reminders = checked_u32("MAX_REMINDERS", n)?;
        }
        if let Some(secs) = env_u64("SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("CAS_MAX_RETRIES")? {
            config.cas_max_retries = checked_u32("CAS_MAX_RETRIES", n)?;
        }
        if let Ok(addr) = std::env::var("OPERATOR_ADDRESS") {
            config.operator_address = addr;
        }

        Ok(config)
    }
}

fn checked_u32(key: &str, value: u64) -> Result<u32, ConfigError> {
    u32::try_from(value).map_err(|_| ConfigError::InvalidValue {
        key: key.into(),
        message: format!("out of range: {value}"),
    })
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.into(),
                message: format!("not an integer: {raw}"),
            }),
        Err(_) => Ok(None),
    }
}
