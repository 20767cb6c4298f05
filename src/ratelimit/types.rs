//! Rate limiting domain types and error definitions.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed window size a counter accumulates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Minute, Granularity::Hour, Granularity::Day];

    /// Window length in seconds.
    pub const fn seconds(self) -> i64 {
        match self {
            Granularity::Minute => 60,
            Granularity::Hour => 3_600,
            Granularity::Day => 86_400,
        }
    }

    /// `floor(now, granularity)` as a unix timestamp.
    pub fn window_start(self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.seconds()) * self.seconds()
    }

    /// First instant of the next window.
    pub fn window_end(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let end = self.window_start(now) + self.seconds();
        Utc.timestamp_opt(end, 0).single().unwrap_or(now)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity a counter is tracked against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScopeKey {
    /// All traffic matching the rule shares one counter.
    Global,
    User { user: String },
    Ip { ip: String },
    UserIp { user: String, ip: String },
}

/// Placeholder used when a user-scoped rule sees an unauthenticated request.
pub const ANONYMOUS_USER: &str = "anonymous";
/// Placeholder used when an ip-scoped rule sees a request without a peer address.
pub const UNKNOWN_IP: &str = "unknown";

impl ScopeKey {
    /// Derive the scope for a rule's flags and a request.
    pub fn derive(user_specific: bool, ip_specific: bool, request: &RequestDescriptor) -> Self {
        let user = || {
            request
                .user_id
                .clone()
                .unwrap_or_else(|| ANONYMOUS_USER.to_string())
        };
        let ip = || request.ip.clone().unwrap_or_else(|| UNKNOWN_IP.to_string());

        match (user_specific, ip_specific) {
            (true, true) => ScopeKey::UserIp { user: user(), ip: ip() },
            (true, false) => ScopeKey::User { user: user() },
            (false, true) => ScopeKey::Ip { ip: ip() },
            (false, false) => ScopeKey::Global,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Global => f.write_str("global"),
            ScopeKey::User { user } => write!(f, "user:{}", user),
            ScopeKey::Ip { ip } => write!(f, "ip:{}", ip),
            ScopeKey::UserIp { user, ip } => write!(f, "user:{}|ip:{}", user, ip),
        }
    }
}

/// What the limiter sees of an incoming request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub endpoint: String,
    pub method: String,
    pub user_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestDescriptor {
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    /// A window counter went over its limit.
    RateLimited {
        rule: String,
        granularity: Granularity,
        count: u64,
        limit: u64,
    },
    /// The scope has an unexpired block entry.
    Blocked {
        rule: String,
        expires_at: DateTime<Utc>,
    },
}

impl DenyReason {
    pub fn rule(&self) -> &str {
        match self {
            DenyReason::RateLimited { rule, .. } | DenyReason::Blocked { rule, .. } => rule,
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::RateLimited { rule, granularity, count, limit } => write!(
                f,
                "rate limit '{}' exceeded: {} requests per {} (limit {})",
                rule, count, granularity, limit
            ),
            DenyReason::Blocked { rule, expires_at } => {
                write!(f, "blocked by rule '{}' until {}", rule, expires_at.to_rfc3339())
            }
        }
    }
}

/// Outcome of [`RateLimiter::evaluate`](crate::ratelimit::RateLimiter::evaluate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny {
        reason: DenyReason,
        #[serde(with = "duration_secs")]
        retry_after: Duration,
    },
}

impl Decision {
    pub fn allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn reason(&self) -> Option<&DenyReason> {
        match self {
            Decision::Allow => None,
            Decision::Deny { reason, .. } => Some(reason),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Allow => None,
            Decision::Deny { retry_after, .. } => Some(*retry_after),
        }
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    /// Whole seconds, rounded up so a client never retries before the window ends.
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs() + u64::from(d.subsec_nanos() > 0))
    }
}

/// Post-increment count of one window at the moment of a violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCount {
    pub granularity: Granularity,
    pub window_start: i64,
    pub count: u64,
    pub limit: u64,
}

impl WindowCount {
    pub fn exceeded(&self) -> bool {
        self.count > self.limit
    }
}

/// What the limiter did about a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationAction {
    Denied,
    DeniedAndBlocked,
}

impl ViolationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationAction::Denied => "denied",
            ViolationAction::DeniedAndBlocked => "denied_and_blocked",
        }
    }
}

/// Snapshot of a rule going over its limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitViolation {
    pub rule_id: String,
    pub scope_key: ScopeKey,
    pub endpoint: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
    pub counts: Vec<WindowCount>,
    pub action: ViolationAction,
}

/// Time-boxed deny-all record for a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub scope_key: ScopeKey,
    pub rule_id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BlockEntry {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

/// Rejections raised when a rule is created or updated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleConfigError {
    #[error("rule name must not be empty")]
    EmptyName,

    #[error("rule '{rule}': invalid endpoint pattern: {message}")]
    InvalidPattern { rule: String, message: String },

    #[error("rule '{rule}': invalid http method '{method}'")]
    InvalidMethod { rule: String, method: String },

    #[error("rule '{rule}': {granularity} limit must be positive")]
    NonPositiveLimit { rule: String, granularity: Granularity },

    #[error("rule '{rule}': at least one of per_minute, per_hour, per_day is required")]
    NoLimits { rule: String },

    #[error("rule '{rule}': auto-block {field} must be positive")]
    InvalidAutoBlock { rule: String, field: &'static str },

    #[error("duplicate rule name '{0}'")]
    DuplicateRule(String),
}

/// The counter backend could not be reached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("counter store unavailable: {0}")]
pub struct StoreUnavailable(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_window_truncation() {
        let now = at("2024-05-01T10:17:42Z");
        assert_eq!(Granularity::Minute.window_start(now), at("2024-05-01T10:17:00Z").timestamp());
        assert_eq!(Granularity::Hour.window_start(now), at("2024-05-01T10:00:00Z").timestamp());
        assert_eq!(Granularity::Day.window_start(now), at("2024-05-01T00:00:00Z").timestamp());
        assert_eq!(Granularity::Minute.window_end(now), at("2024-05-01T10:18:00Z"));
    }

    #[test]
    fn test_scope_derivation() {
        let req = RequestDescriptor::new("/api", "GET").with_user("42").with_ip("10.0.0.1");

        assert_eq!(
            ScopeKey::derive(true, true, &req),
            ScopeKey::UserIp { user: "42".into(), ip: "10.0.0.1".into() }
        );
        assert_eq!(ScopeKey::derive(true, false, &req), ScopeKey::User { user: "42".into() });
        assert_eq!(ScopeKey::derive(false, true, &req), ScopeKey::Ip { ip: "10.0.0.1".into() });
        assert_eq!(ScopeKey::derive(false, false, &req), ScopeKey::Global);

        let anon = RequestDescriptor::new("/api", "GET");
        assert_eq!(
            ScopeKey::derive(true, true, &anon).to_string(),
            "user:anonymous|ip:unknown"
        );
    }

    #[test]
    fn test_block_remaining() {
        let now = at("2024-05-01T10:00:00Z");
        let block = BlockEntry {
            scope_key: ScopeKey::Global,
            rule_id: "r".into(),
            reason: "test".into(),
            created_at: now,
            expires_at: at("2024-05-01T10:05:00Z"),
        };
        assert!(block.is_active(now));
        assert_eq!(block.remaining(now), Duration::from_secs(300));
        assert!(!block.is_active(at("2024-05-01T10:05:00Z")));
    }

    #[test]
    fn test_retry_after_serializes_rounded_up() {
        let deny = |retry_after| Decision::Deny {
            reason: DenyReason::RateLimited {
                rule: "auth".into(),
                granularity: Granularity::Minute,
                count: 11,
                limit: 10,
            },
            retry_after,
        };

        let json = serde_json::to_value(deny(Duration::from_millis(300))).unwrap();
        assert_eq!(json["retry_after"], 1);
        let json = serde_json::to_value(deny(Duration::from_millis(29_001))).unwrap();
        assert_eq!(json["retry_after"], 30);
        let json = serde_json::to_value(deny(Duration::from_secs(30))).unwrap();
        assert_eq!(json["retry_after"], 30);
        assert_eq!(json["decision"], "deny");
    }

    #[test]
    fn test_error_display() {
        let err = RuleConfigError::NonPositiveLimit {
            rule: "login".into(),
            granularity: Granularity::Hour,
        };
        assert_eq!(err.to_string(), "rule 'login': hour limit must be positive");
    }
}
