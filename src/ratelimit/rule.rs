//! Rate limit rule definition and validation.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ratelimit::types::{Granularity, RequestDescriptor, RuleConfigError, ScopeKey};

/// Matches every HTTP method.
pub const ANY_METHOD: &str = "*";

/// Escalation policy: enough violations inside the lookback window blocks the scope.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AutoBlockPolicy {
    /// Violations needed within `lookback_secs` to create a block.
    pub violation_threshold: u32,

    /// Lookback window in seconds.
    pub lookback_secs: u64,

    /// How long the block lasts in seconds.
    pub block_duration_secs: u64,
}

/// A single rate limit rule.
///
/// The rule name doubles as its id for counters, blocks and violations.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitRule {
    /// Unique rule identifier.
    pub name: String,

    /// Regex over the request path. Must match the whole path.
    pub endpoint_pattern: String,

    /// HTTP method, or `*` for any.
    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub per_minute: Option<u64>,

    #[serde(default)]
    pub per_hour: Option<u64>,

    #[serde(default)]
    pub per_day: Option<u64>,

    /// Count per authenticated user.
    #[serde(default)]
    pub user_specific: bool,

    /// Count per client IP.
    #[serde(default)]
    pub ip_specific: bool,

    /// Higher priority rules are reported first when several deny.
    #[serde(default)]
    pub priority: Option<i32>,

    #[serde(default)]
    pub auto_block: Option<AutoBlockPolicy>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_method() -> String {
    ANY_METHOD.to_string()
}

fn default_enabled() -> bool {
    true
}

impl RateLimitRule {
    pub fn new(name: impl Into<String>, endpoint_pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint_pattern: endpoint_pattern.into(),
            method: default_method(),
            per_minute: None,
            per_hour: None,
            per_day: None,
            user_specific: false,
            ip_specific: false,
            priority: None,
            auto_block: None,
            enabled: true,
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn per_minute(mut self, limit: u64) -> Self {
        self.per_minute = Some(limit);
        self
    }

    pub fn per_hour(mut self, limit: u64) -> Self {
        self.per_hour = Some(limit);
        self
    }

    pub fn per_day(mut self, limit: u64) -> Self {
        self.per_day = Some(limit);
        self
    }

    pub fn user_scoped(mut self) -> Self {
        self.user_specific = true;
        self
    }

    pub fn ip_scoped(mut self) -> Self {
        self.ip_specific = true;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn auto_block(mut self, violation_threshold: u32, lookback_secs: u64, block_duration_secs: u64) -> Self {
        self.auto_block = Some(AutoBlockPolicy {
            violation_threshold,
            lookback_secs,
            block_duration_secs,
        });
        self
    }

    /// Configured limits, finest granularity first.
    pub fn limits(&self) -> impl Iterator<Item = (Granularity, u64)> + '_ {
        Granularity::ALL.into_iter().filter_map(move |g| self.limit_for(g).map(|l| (g, l)))
    }

    pub fn limit_for(&self, granularity: Granularity) -> Option<u64> {
        match granularity {
            Granularity::Minute => self.per_minute,
            Granularity::Hour => self.per_hour,
            Granularity::Day => self.per_day,
        }
    }

    pub fn scope_key(&self, request: &RequestDescriptor) -> ScopeKey {
        ScopeKey::derive(self.user_specific, self.ip_specific, request)
    }

    /// Pattern wrapped so that it must match the whole endpoint.
    pub fn anchored_pattern(&self) -> String {
        format!("^(?:{})$", self.endpoint_pattern)
    }

    pub fn matches_method(&self, method: &str) -> bool {
        self.method == ANY_METHOD || self.method.eq_ignore_ascii_case(method)
    }

    /// Reject anything that must never reach `evaluate`.
    pub fn validate(&self) -> Result<(), RuleConfigError> {
        if self.name.trim().is_empty() {
            return Err(RuleConfigError::EmptyName);
        }

        if let Err(e) = Regex::new(&self.anchored_pattern()) {
            return Err(RuleConfigError::InvalidPattern {
                rule: self.name.clone(),
                message: e.to_string(),
            });
        }

        let method_ok = self.method == ANY_METHOD
            || (!self.method.is_empty() && self.method.chars().all(|c| c.is_ascii_alphabetic()));
        if !method_ok {
            return Err(RuleConfigError::InvalidMethod {
                rule: self.name.clone(),
                method: self.method.clone(),
            });
        }

        let mut any = false;
        for granularity in Granularity::ALL {
            match self.limit_for(granularity) {
                Some(0) => {
                    return Err(RuleConfigError::NonPositiveLimit {
                        rule: self.name.clone(),
                        granularity,
                    })
                }
                Some(_) => any = true,
                None => {}
            }
        }
        if !any {
            return Err(RuleConfigError::NoLimits { rule: self.name.clone() });
        }

        if let Some(policy) = &self.auto_block {
            let bad_field = if policy.violation_threshold == 0 {
                Some("violation_threshold")
            } else if policy.lookback_secs == 0 {
                Some("lookback_secs")
            } else if policy.block_duration_secs == 0 {
                Some("block_duration_secs")
            } else {
                None
            };
            if let Some(field) = bad_field {
                return Err(RuleConfigError::InvalidAutoBlock {
                    rule: self.name.clone(),
                    field,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_rule() {
        let rule = RateLimitRule::new("auth", "/api/auth/.*")
            .method("POST")
            .per_minute(10)
            .per_hour(50)
            .per_day(200)
            .ip_scoped();
        assert!(rule.validate().is_ok());
        assert_eq!(
            rule.limits().collect::<Vec<_>>(),
            vec![(Granularity::Minute, 10), (Granularity::Hour, 50), (Granularity::Day, 200)]
        );
    }

    #[test]
    fn test_rejects_bad_pattern() {
        let rule = RateLimitRule::new("broken", "/api/(unclosed").per_minute(1);
        assert!(matches!(rule.validate(), Err(RuleConfigError::InvalidPattern { .. })));
    }

    #[test]
    fn test_rejects_zero_limit() {
        let rule = RateLimitRule::new("zero", "/x").per_minute(5).per_hour(0);
        assert_eq!(
            rule.validate(),
            Err(RuleConfigError::NonPositiveLimit {
                rule: "zero".into(),
                granularity: Granularity::Hour
            })
        );
    }

    #[test]
    fn test_rejects_missing_limits() {
        let rule = RateLimitRule::new("none", "/x");
        assert_eq!(rule.validate(), Err(RuleConfigError::NoLimits { rule: "none".into() }));
    }

    #[test]
    fn test_rejects_bad_auto_block() {
        let rule = RateLimitRule::new("ab", "/x").per_minute(1).auto_block(3, 0, 60);
        assert_eq!(
            rule.validate(),
            Err(RuleConfigError::InvalidAutoBlock {
                rule: "ab".into(),
                field: "lookback_secs"
            })
        );
    }

    #[test]
    fn test_rejects_bad_method() {
        let rule = RateLimitRule::new("m", "/x").method("PO ST").per_minute(1);
        assert!(matches!(rule.validate(), Err(RuleConfigError::InvalidMethod { .. })));
    }

    #[test]
    fn test_method_matching() {
        let any = RateLimitRule::new("any", "/x").per_minute(1);
        assert!(any.matches_method("DELETE"));

        let post = RateLimitRule::new("post", "/x").method("post").per_minute(1);
        assert!(post.matches_method("POST"));
        assert!(!post.matches_method("GET"));
    }

    #[test]
    fn test_deserialize_from_toml() {
        let rule: RateLimitRule = toml::from_str(
            r#"
            name = "login"
            endpoint_pattern = "/api/auth/login"
            method = "POST"
            per_minute = 5
            ip_specific = true

            [auto_block]
            violation_threshold = 3
            lookback_secs = 600
            block_duration_secs = 3600
            "#,
        )
        .unwrap();

        assert!(rule.enabled);
        assert!(rule.ip_specific);
        assert!(!rule.user_specific);
        assert_eq!(rule.auto_block.as_ref().unwrap().violation_threshold, 3);
        assert!(rule.validate().is_ok());
    }
}
