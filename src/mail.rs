//! Mail boundary — parsing inbound RFC822 and sending follow-ups via SMTP.
//!
//! Inbound messages arrive pushed (webhook or relay pipe) as raw RFC822;
//! parsing normalizes them to `InboundEmail` with a stable thread key.
//! Outbound goes through the `MailSender` trait so tests can capture what
//! the orchestrator would have sent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::MessageParser;
use tracing::info;
use uuid::Uuid;

use crate::error::{ConfigError, MailError};

// ── Inbound ─────────────────────────────────────────────────────────

/// One normalized inbound email, the unit the dispatcher works with.
#[derive(Debug, Clone)]
pub struct InboundEmail {
    /// Conversation key. Stable across the whole thread.
    pub thread_id: String,
    /// Provider message id, unique per delivery attempt's payload.
    pub message_id: String,
    pub sender: String,
    pub subject: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Parse a raw RFC822 message into an `InboundEmail`.
///
/// Thread key preference: `In-Reply-To` target, then the message's own id,
/// so replies land on the same key as the message that opened the thread.
pub fn parse_inbound(raw: &[u8]) -> Result<InboundEmail, MailError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailError::InvalidMessage("unparseable RFC822 payload".into()))?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .ok_or_else(|| MailError::InvalidMessage("no sender address".into()))?;

    let message_id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    let thread_id = parsed
        .in_reply_to()
        .as_text_list()
        .and_then(|ids| ids.first().map(|s| s.to_string()))
        .unwrap_or_else(|| message_id.clone());

    let subject = parsed.subject().map(|s| s.to_string());
    let body = extract_text(&parsed);

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Ok(InboundEmail {
        thread_id,
        message_id,
        sender,
        subject,
        body,
        received_at,
    })
}

/// Extract readable text from a parsed email, falling back to stripped HTML.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    "(no readable content)".to_string()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Outbound ────────────────────────────────────────────────────────

/// Outbound mail seam. Returns the message id of what was sent so the
/// follow-up descriptor can reference it.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<String, MailError>;
}

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

impl SmtpConfig {
    /// Build config from environment. `SMTP_HOST` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("SMTP_HOST")
            .map_err(|_| ConfigError::MissingEnvVar("SMTP_HOST".into()))?;
        let port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);
        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = std::env::var("SMTP_PASSWORD").unwrap_or_default();
        let from_address =
            std::env::var("SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());
        Ok(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

/// SMTP sender over lettre. The blocking transport runs in spawn_blocking.
pub struct SmtpMailSender {
    config: SmtpConfig,
}

impl SmtpMailSender {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn send_blocking(
        config: &SmtpConfig,
        to: &str,
        subject: &str,
        body: &str,
        message_id: &str,
    ) -> Result<(), MailError> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| MailError::SendFailed {
                to: to.to_string(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        let email = Message::builder()
            .from(config.from_address.parse().map_err(|e| {
                MailError::SendFailed {
                    to: to.to_string(),
                    reason: format!("Invalid from address: {e}"),
                }
            })?)
            .to(to.parse().map_err(|e| MailError::SendFailed {
                to: to.to_string(),
                reason: format!("Invalid to address: {e}"),
            })?)
            .message_id(Some(message_id.to_string()))
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| MailError::SendFailed {
                to: to.to_string(),
                reason: format!("Failed to build email: {e}"),
            })?;

        transport.send(&email).map_err(|e| MailError::SendFailed {
            to: to.to_string(),
            reason: format!("SMTP send failed: {e}"),
        })?;

        Ok(())
    }
}

#[async_trait]
impl MailSender for SmtpMailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<String, MailError> {
        let message_id = format!("<{}@{}>", Uuid::new_v4(), self.config.host);
        let config = self.config.clone();
        let (to_owned, subject_owned, body_owned, mid) = (
            to.to_string(),
            subject.to_string(),
            body.to_string(),
            message_id.clone(),
        );

        tokio::task::spawn_blocking(move || {
            Self::send_blocking(&config, &to_owned, &subject_owned, &body_owned, &mid)
        })
        .await
        .map_err(|e| MailError::SendFailed {
            to: to.to_string(),
            reason: format!("send task panicked: {e}"),
        })??;

        info!(to, subject, "Email sent");
        Ok(message_id)
    }
}
