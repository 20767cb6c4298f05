//! Security event types and error definitions.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::JsonlError;

/// Well-known event types.
pub mod event_types {
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    pub const RATE_LIMIT_BLOCK_CREATED: &str = "rate_limit_block_created";
    pub const RATE_LIMIT_STORE_UNAVAILABLE: &str = "rate_limit_store_unavailable";
    pub const LOGIN_FAILED: &str = "login_failed";
    pub const LOGIN_SUCCEEDED: &str = "login_succeeded";
    pub const DECRYPTION_FAILURE: &str = "decryption_failure";
    pub const KEY_ROTATED: &str = "encryption_key_rotated";
}

/// Event severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as submitted by a caller, before sequencing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSecurityEvent {
    pub event_type: String,
    pub user_id: Option<String>,
    pub ip: String,
    pub user_agent: String,
    pub severity: Severity,
    pub details: BTreeMap<String, String>,
}

impl NewSecurityEvent {
    pub fn new(event_type: impl Into<String>, severity: Severity) -> Self {
        Self {
            event_type: event_type.into(),
            user_id: None,
            ip: String::new(),
            user_agent: String::new(),
            severity,
            details: BTreeMap::new(),
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn maybe_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

/// An appended, immutable event.
///
/// `hash` covers every other field including `prev_hash`, linking each event
/// to its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub sequence: u64,
    pub event_type: String,
    pub user_id: Option<String>,
    pub ip: String,
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub details: BTreeMap<String, String>,
    pub prev_hash: String,
    pub hash: String,
}

/// Filter for event queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    pub severity: Option<Severity>,
    pub user_id: Option<String>,
    pub event_type: Option<String>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn since(mut self, t: DateTime<Utc>) -> Self {
        self.since = Some(t);
        self
    }

    pub fn until(mut self, t: DateTime<Utc>) -> Self {
        self.until = Some(t);
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Non-time predicates; the time range is applied by index lookup.
    pub(crate) fn accepts(&self, event: &SecurityEvent) -> bool {
        self.severity.map_or(true, |s| event.severity == s)
            && self
                .user_id
                .as_deref()
                .map_or(true, |u| event.user_id.as_deref() == Some(u))
            && self
                .event_type
                .as_deref()
                .map_or(true, |t| event.event_type == t)
    }
}

/// Errors that can occur in the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Writing to the backing store failed and retries were exhausted.
    #[error("audit persistence failed after {attempts} attempts: {message}")]
    PersistenceExhausted { attempts: u32, message: String },

    #[error("audit store error: {0}")]
    Store(#[from] JsonlError),

    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The hash chain does not verify at `sequence`.
    #[error("audit chain broken at sequence {sequence}: {reason}")]
    ChainBroken { sequence: u64, reason: &'static str },
}

pub type AuditResult<T> = Result<T, AuditError>;
