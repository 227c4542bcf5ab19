//! Priority/team rules engine.
//!
//! Evaluation is a pure function of `(subcategory, fields)` over an ordered
//! rule table scoped by subcategory: first matching rule wins. It never
//! fails — a coverage gap falls back to the lowest priority and its default
//! team so the pipeline can always finalize.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::RulesError;
use crate::ticket::Priority;

/// One rule: a regex condition over a single extracted field.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Human-readable rule description (shows up in logs and audits).
    pub description: String,
    /// Extracted field the condition reads (e.g. `impact`, `location`).
    pub field: String,
    /// Compiled condition.
    pub pattern: Regex,
    pub priority: Priority,
    /// Explicit team override; the priority's default team otherwise.
    pub team: Option<String>,
}

/// Outcome of a rules evaluation. Always produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub priority: Priority,
    pub team: String,
    /// Description of the rule that fired, if any.
    pub matched_rule: Option<String>,
    /// True when no rule covered the inputs and defaults were applied.
    pub coverage_gap: bool,
}

/// Serde shape for rule tables loaded from JSON.
#[derive(Debug, Deserialize)]
struct RuleTableSpec {
    subcategories: BTreeMap<String, Vec<RuleSpec>>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    description: String,
    field: String,
    pattern: String,
    priority: Priority,
    #[serde(default)]
    team: Option<String>,
}

/// Ordered rule tables keyed by subcategory.
#[derive(Debug)]
pub struct RulesEngine {
    tables: BTreeMap<String, Vec<Rule>>,
}

impl RulesEngine {
    /// Default team for each priority level.
    pub fn default_team(priority: Priority) -> &'static str {
        match priority {
            Priority::Critical => "major-incident",
            Priority::Elevated => "support-n2",
            Priority::Standard => "service-desk",
        }
    }

    /// Create an empty engine (everything defaults — for testing).
    pub fn empty() -> Self {
        Self {
            tables: BTreeMap::new(),
        }
    }

    /// Load rule tables from their JSON representation.
    pub fn from_json(json: &str) -> Result<Self, RulesError> {
        let spec: RuleTableSpec =
            serde_json::from_str(json).map_err(|e| RulesError::Parse(e.to_string()))?;

        let mut tables = BTreeMap::new();
        for (subcategory, rules) in spec.subcategories {
            let mut compiled = Vec::with_capacity(rules.len());
            for rule in rules {
                let pattern =
                    Regex::new(&rule.pattern).map_err(|e| RulesError::InvalidPattern {
                        subcategory: subcategory.clone(),
                        message: e.to_string(),
                    })?;
                compiled.push(Rule {
                    description: rule.description,
                    field: rule.field,
                    pattern,
                    priority: rule.priority,
                    team: rule.team,
                });
            }
            tables.insert(subcategory, compiled);
        }
        debug!(subcategories = tables.len(), "Rule tables loaded");
        Ok(Self { tables })
    }

    /// Built-in table covering the common support subcategories.
    pub fn default_rules() -> Self {
        Self::from_json(DEFAULT_RULES_JSON).expect("built-in rule table must parse")
    }

    /// Evaluate the ordered table for `subcategory` against the extracted
    /// fields. First match wins; no match (or no table) defaults to
    /// STANDARD and its default team — logged, never an error.
    pub fn evaluate(&self, subcategory: Option<&str>, fields: &BTreeMap<String, String>) -> Assignment {
        let default = Assignment {
            priority: Priority::Standard,
            team: Self::default_team(Priority::Standard).to_string(),
            matched_rule: None,
            coverage_gap: true,
        };

        let Some(table) = subcategory.and_then(|s| self.tables.get(s)) else {
            warn!(
                subcategory = subcategory.unwrap_or("<none>"),
                "No rule table for subcategory, applying defaults"
            );
            return default;
        };

        for rule in table {
            let Some(value) = fields.get(&rule.field) else {
                continue;
            };
            if rule.pattern.is_match(value) {
                let team = rule
                    .team
                    .clone()
                    .unwrap_or_else(|| Self::default_team(rule.priority).to_string());
                debug!(
                    subcategory = subcategory.unwrap_or_default(),
                    rule = %rule.description,
                    priority = %rule.priority,
                    %team,
                    "Rule matched"
                );
                return Assignment {
                    priority: rule.priority,
                    team,
                    matched_rule: Some(rule.description.clone()),
                    coverage_gap: false,
                };
            }
        }

        warn!(
            subcategory = subcategory.unwrap_or_default(),
            "No rule matched, applying defaults"
        );
        default
    }

    /// Field names the table for `subcategory` reads but the ticket does
    /// not have yet. Drives the `priority` follow-up detour: if the answer
    /// could change the outcome, ask before defaulting.
    pub fn missing_inputs(
        &self,
        subcategory: Option<&str>,
        fields: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let Some(table) = subcategory.and_then(|s| self.tables.get(s)) else {
            return Vec::new();
        };
        let mut missing = Vec::new();
        for rule in table {
            if !fields.contains_key(&rule.field) && !missing.contains(&rule.field) {
                missing.push(rule.field.clone());
            }
        }
        missing
    }

    /// Whether any table exists for the subcategory.
    pub fn has_table(&self, subcategory: &str) -> bool {
        self.tables.contains_key(subcategory)
    }
}

/// Built-in rule tables. Site-specific deployments replace this with a JSON
/// file via `RULES_PATH`.
const DEFAULT_RULES_JSON: &str = r#"{
  "subcategories": {
    "reseau": [
      {
        "description": "Whole site or production network down",
        "field": "impact",
        "pattern": "(?i)site entier|production|tous les utilisateurs|whole site",
        "priority": "CRITICAL",
        "team": "network-ops"
      },
      {
        "description": "Single user network outage",
        "field": "impact",
        "pattern": "(?i)un seul|single user|mon poste",
        "priority": "ELEVATED",
        "team": "network-ops"
      }
    ],
    "messagerie": [
      {
        "description": "Mail service down for a department or more",
        "field": "impact",
        "pattern": "(?i)service|departement|équipe|team",
        "priority": "CRITICAL"
      },
      {
        "description": "Individual mailbox issue",
        "field": "impact",
        "pattern": "(?i)ma boite|mailbox|un seul|single",
        "priority": "ELEVATED"
      }
    ],
    "poste-de-travail": [
      {
        "description": "Workstation blocks all work and no workaround",
        "field": "blocking",
        "pattern": "(?i)oui|yes|bloqu",
        "priority": "ELEVATED",
        "team": "workstation-support"
      },
      {
        "description": "Workstation degraded but usable",
        "field": "blocking",
        "pattern": "(?i)non|no|partiel",
        "priority": "STANDARD",
        "team": "workstation-support"
      }
    ]
  }
}"#;
