//! Metrics collection.
//!
//! # Metrics
//! - `security_rate_limit_decisions_total` (counter): decisions by outcome
//! - `security_rate_limit_violations_total` (counter): violations by rule
//! - `security_rate_limit_blocks_total` (counter): blocks created by rule
//! - `security_rate_limit_active_blocks` (gauge): unexpired blocks after a prune
//! - `security_rate_limit_store_unavailable_total` (counter): fail-open decisions
//! - `security_audit_events_total` (counter): appended events by severity
//! - `security_audit_failures_total` (counter): persistence failures by reason
//! - `security_audit_dropped_total` (counter): jobs the dispatcher could not accept
//! - `security_vault_decrypt_failures_total` (counter)
//! - `security_vault_active_key_version` (gauge)
//! - `security_rollup_refreshes_total` (counter)
//!
//! # Design Decisions
//! - Recorded through the `metrics` facade; the exporter is the embedding
//!   application's choice
//! - Updates are atomic increments and never block

use metrics::{counter, gauge};

use crate::audit::Severity;

pub fn record_decision(outcome: &'static str) {
    counter!("security_rate_limit_decisions_total", "outcome" => outcome).increment(1);
}

pub fn record_violation(rule: &str) {
    counter!("security_rate_limit_violations_total", "rule" => rule.to_string()).increment(1);
}

pub fn record_block_created(rule: &str) {
    counter!("security_rate_limit_blocks_total", "rule" => rule.to_string()).increment(1);
}

pub fn record_active_blocks(count: usize) {
    gauge!("security_rate_limit_active_blocks").set(count as f64);
}

pub fn record_store_unavailable(rule: &str) {
    counter!("security_rate_limit_store_unavailable_total", "rule" => rule.to_string()).increment(1);
}

pub fn record_audit_append(severity: Severity) {
    counter!("security_audit_events_total", "severity" => severity.as_str()).increment(1);
}

pub fn record_audit_failure(reason: &'static str) {
    counter!("security_audit_failures_total", "reason" => reason).increment(1);
}

pub fn record_audit_dropped(reason: &'static str) {
    counter!("security_audit_dropped_total", "reason" => reason).increment(1);
}

pub fn record_decrypt_failure() {
    counter!("security_vault_decrypt_failures_total").increment(1);
}

pub fn record_active_key_version(version: u32) {
    gauge!("security_vault_active_key_version").set(f64::from(version));
}

pub fn record_rollup_refresh() {
    counter!("security_rollup_refreshes_total").increment(1);
}
