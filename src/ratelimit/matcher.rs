//! Compiled rule matching.
//!
//! # Responsibilities
//! - Compile every rule pattern once, at load/update time
//! - Match an endpoint against all patterns in one pass
//! - Filter by HTTP method and the enabled flag
//!
//! # Design Decisions
//! - Patterns are anchored: a rule must match the whole path
//! - All matching rules are returned, not just the first
//! - Rules are ordered by priority (highest first), then by load order

use std::collections::HashSet;

use regex::RegexSet;

use crate::ratelimit::rule::RateLimitRule;
use crate::ratelimit::types::RuleConfigError;

/// Immutable, precompiled view of the configured rules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<RateLimitRule>,
    patterns: RegexSet,
}

impl RuleSet {
    /// Validate and compile a set of rules.
    pub fn compile(mut rules: Vec<RateLimitRule>) -> Result<Self, RuleConfigError> {
        let mut names = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !names.insert(rule.name.as_str()) {
                return Err(RuleConfigError::DuplicateRule(rule.name.clone()));
            }
        }

        // Stable sort keeps load order among equal priorities.
        rules.sort_by(|a, b| b.priority.unwrap_or(0).cmp(&a.priority.unwrap_or(0)));

        let patterns = RegexSet::new(rules.iter().map(|r| r.anchored_pattern())).map_err(|e| {
            RuleConfigError::InvalidPattern {
                rule: "<rule set>".to_string(),
                message: e.to_string(),
            }
        })?;

        Ok(Self { rules, patterns })
    }

    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            patterns: RegexSet::empty(),
        }
    }

    /// Enabled rules matching both endpoint and method, highest priority first.
    pub fn matching<'a>(&'a self, endpoint: &str, method: &str) -> Vec<&'a RateLimitRule> {
        if self.rules.is_empty() {
            return Vec::new();
        }
        // RegexSet yields indices in ascending order, which is priority order.
        self.patterns
            .matches(endpoint)
            .into_iter()
            .map(|idx| &self.rules[idx])
            .filter(|rule| rule.enabled && rule.matches_method(method))
            .collect()
    }

    pub fn rules(&self) -> &[RateLimitRule] {
        &self.rules
    }

    pub fn get(&self, name: &str) -> Option<&RateLimitRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::empty()
    }
}
