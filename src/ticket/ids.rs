//! Human-readable ticket identifier formats.
//!
//! Formatting is a pure function of `(date, sequence)` — the atomic part of
//! id allocation lives in the durable counter, not here.

use chrono::NaiveDate;

/// Format a final ticket id: `TKT-YYYYMMDD-NNNN`.
///
/// The sequence is zero-padded to 4 digits and widens beyond 9999.
pub fn format_final_id(date: NaiveDate, sequence: u64) -> String {
    format!("TKT-{}-{:04}", date.format("%Y%m%d"), sequence)
}

/// Format a temporary ticket id: `TEMP-<STAGE>-YYYYMMDD-NNNN`.
///
/// `stage_token` names the work the pipeline is about to do (e.g. `FIELDS`).
pub fn format_temp_id(stage_token: &str, date: NaiveDate, sequence: u64) -> String {
    format!("TEMP-{}-{}-{:04}", stage_token, date.format("%Y%m%d"), sequence)
}

/// Extract the `YYYYMMDD` day component of a ticket id, if well-formed.
/// Used by the store's date-range filter.
pub fn ticket_day(id: &str) -> Option<&str> {
    let parts: Vec<&str> = id.split('-').collect();
    let day = match parts.as_slice() {
        ["TKT", day, _seq] => day,
        ["TEMP", _stage, day, _seq] => day,
        _ => return None,
    };
    (day.len() == 8 && day.bytes().all(|b| b.is_ascii_digit())).then_some(*day)
}
