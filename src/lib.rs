//! Maildesk — support-email triage pipeline.

pub mod capability;
pub mod config;
pub mod correlate;
pub mod dashboard;
pub mod dispatch;
pub mod error;
pub mod followup;
pub mod idgen;
pub mod mail;
pub mod pipeline;
pub mod rules;
pub mod store;
pub mod testing;
pub mod ticket;
