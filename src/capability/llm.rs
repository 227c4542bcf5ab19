//! LLM-backed capability implementations.
//!
//! One HTTPS chat-completions client behind all three extraction traits.
//! Prompts are tight and demand a bare JSON object; parsing tolerates
//! markdown-fenced output because models wrap responses anyway.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::capability::{
    Classification, Classifier, FieldExtraction, FieldExtractor, SubcategoryExtractor,
    SubcategoryGuess,
};
use crate::error::{CapabilityError, ConfigError};
use crate::ticket::Category;

/// Temperature for extraction calls (deterministic-ish).
const EXTRACTION_TEMPERATURE: f32 = 0.1;

/// Subcategory vocabulary offered to the model when none is configured.
const DEFAULT_SUBCATEGORIES: &[&str] = &[
    "reseau",
    "messagerie",
    "poste-de-travail",
    "acces-applicatif",
    "impression",
    "telephonie",
];

/// Required ticket fields when none are configured.
const DEFAULT_REQUIRED_FIELDS: &[&str] = &["name", "email", "location", "description"];

// ── Configuration ───────────────────────────────────────────────────

/// Chat-completions endpoint configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub api_key: SecretString,
    pub model: String,
}

impl LlmConfig {
    /// Build from environment. `LLM_API_KEY` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("LLM_API_KEY".into()))?;
        let endpoint = std::env::var("LLM_ENDPOINT")
            .unwrap_or_else(|_| "https://api.mistral.ai/v1/chat/completions".to_string());
        let model =
            std::env::var("LLM_MODEL").unwrap_or_else(|_| "mistral-small-latest".to_string());
        Ok(Self {
            endpoint,
            api_key: SecretString::from(api_key),
            model,
        })
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// LLM client implementing all three capability traits.
pub struct LlmExtractor {
    http: reqwest::Client,
    config: LlmConfig,
    subcategories: Vec<String>,
    required_fields: Vec<String>,
}

impl LlmExtractor {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            subcategories: DEFAULT_SUBCATEGORIES.iter().map(|s| s.to_string()).collect(),
            required_fields: DEFAULT_REQUIRED_FIELDS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replace the subcategory vocabulary offered to the model.
    pub fn with_subcategories(mut self, subcategories: Vec<String>) -> Self {
        self.subcategories = subcategories;
        self
    }

    /// Replace the required field list.
    pub fn with_required_fields(mut self, fields: Vec<String>) -> Self {
        self.required_fields = fields;
        self
    }

    /// One chat-completions round trip. Network and throttling failures are
    /// transient; anything the API rejects outright is not.
    async fn chat(&self, system: &str, user: &str) -> Result<String, CapabilityError> {
        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&json!({
                "model": self.config.model,
                "temperature": EXTRACTION_TEMPERATURE,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user}
                ],
                "response_format": {"type": "json_object"}
            }))
            .send()
            .await
            .map_err(|e| CapabilityError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(CapabilityError::Transient(format!("upstream status {status}")));
        }
        if !status.is_success() {
            return Err(CapabilityError::Invalid(format!("upstream status {status}")));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::Transient(format!("body read failed: {e}")))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CapabilityError::Invalid("no choices in response".into()))?;

        debug!(model = %self.config.model, "LLM call complete");
        Ok(content)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl Classifier for LlmExtractor {
    async fn classify(&self, email_text: &str) -> Result<Classification, CapabilityError> {
        let raw = self
            .chat(CLASSIFY_SYSTEM_PROMPT, &build_classify_user_prompt(email_text))
            .await?;
        parse_classification(&raw).inspect_err(|e| {
            warn!(error = %e, raw = %raw.chars().take(200).collect::<String>(), "Unparseable classification");
        })
    }
}

#[async_trait]
impl FieldExtractor for LlmExtractor {
    async fn extract_fields(
        &self,
        email_text: &str,
        prior_fields: &BTreeMap<String, String>,
    ) -> Result<FieldExtraction, CapabilityError> {
        let raw = self
            .chat(
                &build_fields_system_prompt(&self.required_fields),
                &build_fields_user_prompt(email_text, prior_fields),
            )
            .await?;
        parse_field_extraction(&raw).inspect_err(|e| {
            warn!(error = %e, "Unparseable field extraction");
        })
    }
}

#[async_trait]
impl SubcategoryExtractor for LlmExtractor {
    async fn extract_subcategory(
        &self,
        email_text: &str,
        category: Category,
    ) -> Result<SubcategoryGuess, CapabilityError> {
        let raw = self
            .chat(
                &build_subcategory_system_prompt(&self.subcategories),
                &build_subcategory_user_prompt(email_text, category),
            )
            .await?;
        parse_subcategory(&raw).inspect_err(|e| {
            warn!(error = %e, "Unparseable subcategory extraction");
        })
    }
}

// ── Prompt construction ─────────────────────────────────────────────

const CLASSIFY_SYSTEM_PROMPT: &str = "You classify inbound IT support emails.\n\
    Categories:\n\
    - \"Incident\": something is broken or degraded.\n\
    - \"Demande\": a service request (access, equipment, information).\n\n\
    Respond with ONLY a JSON object:\n\
    {\"category\": \"Incident\" or \"Demande\", \"confidence\": 0.0-1.0, \"evidence\": \"short quote\"}";

fn build_classify_user_prompt(email_text: &str) -> String {
    let preview: String = email_text.chars().take(4000).collect();
    format!("Email thread:\n{preview}")
}

fn build_fields_system_prompt(required: &[String]) -> String {
    format!(
        "You extract requester information from IT support email threads.\n\
         Required fields: {}.\n\
         Respond with ONLY a JSON object:\n\
         {{\"fields\": {{\"<name>\": \"<value>\", ...}}, \"missing\": [\"<field>\", ...], \"confidence\": 0.0-1.0}}\n\
         Rules:\n\
         - Only include fields the text actually supports; never invent values.\n\
         - List every required field you could not find under \"missing\".\n\
         - Values already known are given as context; do not contradict them.",
        required.join(", ")
    )
}

fn build_fields_user_prompt(email_text: &str, prior: &BTreeMap<String, String>) -> String {
    let mut prompt = String::with_capacity(512);
    if !prior.is_empty() {
        prompt.push_str("Already known:\n");
        for (k, v) in prior {
            prompt.push_str(&format!("  {k}: {v}\n"));
        }
        prompt.push('\n');
    }
    let preview: String = email_text.chars().take(4000).collect();
    prompt.push_str(&format!("Email thread:\n{preview}"));
    prompt
}

fn build_subcategory_system_prompt(subcategories: &[String]) -> String {
    format!(
        "You assign IT support tickets to exactly one subcategory.\n\
         Allowed subcategories: {}.\n\
         Respond with ONLY a JSON object:\n\
         {{\"subcategory\": \"<one of the allowed values>\" or null, \"confidence\": 0.0-1.0}}\n\
         Use null when none of the allowed subcategories fits.",
        subcategories.join(", ")
    )
}

fn build_subcategory_user_prompt(email_text: &str, category: Category) -> String {
    let preview: String = email_text.chars().take(4000).collect();
    format!("Category: {}\n\nEmail thread:\n{preview}", category.label())
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ClassificationRaw {
    category: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    evidence: Option<String>,
}

fn parse_classification(raw: &str) -> Result<Classification, CapabilityError> {
    let json_str = extract_json_object(raw);
    let parsed: ClassificationRaw = serde_json::from_str(&json_str)
        .map_err(|e| CapabilityError::Invalid(format!("classification JSON: {e}")))?;

    let label = match parsed.category.to_lowercase().as_str() {
        "incident" => Category::Incident,
        "demande" => Category::Demande,
        other => {
            return Err(CapabilityError::Invalid(format!(
                "unknown category label: '{other}'"
            )));
        }
    };
    Ok(Classification {
        label,
        confidence: parsed.confidence.clamp(0.0, 1.0),
        evidence: parsed.evidence.filter(|e| !e.is_empty()),
    })
}

#[derive(Debug, Deserialize)]
struct FieldExtractionRaw {
    #[serde(default)]
    fields: BTreeMap<String, String>,
    #[serde(default)]
    missing: Vec<String>,
    #[serde(default)]
    confidence: f32,
}

fn parse_field_extraction(raw: &str) -> Result<FieldExtraction, CapabilityError> {
    let json_str = extract_json_object(raw);
    let parsed: FieldExtractionRaw = serde_json::from_str(&json_str)
        .map_err(|e| CapabilityError::Invalid(format!("field extraction JSON: {e}")))?;
    Ok(FieldExtraction {
        fields: parsed.fields,
        missing: parsed.missing,
        confidence: parsed.confidence.clamp(0.0, 1.0),
    })
}

#[derive(Debug, Deserialize)]
struct SubcategoryRaw {
    #[serde(default)]
    subcategory: Option<String>,
    #[serde(default)]
    confidence: f32,
}

fn parse_subcategory(raw: &str) -> Result<SubcategoryGuess, CapabilityError> {
    let json_str = extract_json_object(raw);
    let parsed: SubcategoryRaw = serde_json::from_str(&json_str)
        .map_err(|e| CapabilityError::Invalid(format!("subcategory JSON: {e}")))?;
    Ok(SubcategoryGuess {
        subcategory: parsed.subcategory.filter(|s| !s.is_empty()),
        confidence: parsed.confidence.clamp(0.0, 1.0),
    })
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
