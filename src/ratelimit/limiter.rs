//! Request evaluation against the live rule set.
//!
//! # Data Flow
//! ```text
//! RequestDescriptor
//!     → RuleSet::matching (one RegexSet pass + method filter)
//!     → scope key per matching rule
//!     → BlockStore::active (any blocked scope denies, counters untouched)
//!     → CounterStore::increment per configured granularity
//!     → violated rules: AuditSink + auto-block escalation
//!     → Decision
//! ```
//!
//! # Design Decisions
//! - Fixed windows: `window_start = floor(now, granularity)`. A client can burst
//!   up to twice the limit across a window boundary
//! - Every matching rule is evaluated and counted; any violated rule denies
//! - Denied requests still increment counters
//! - A counter store failure fails open for that rule and raises a critical alert
//! - The rule set is swapped atomically; an evaluation sees one consistent snapshot

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::audit::{event_types, AuditJob, AuditSink, NewSecurityEvent, Severity};
use crate::clock::SharedClock;
use crate::observability::metrics;
use crate::ratelimit::block::BlockStore;
use crate::ratelimit::counter::{CounterKey, CounterStore};
use crate::ratelimit::matcher::RuleSet;
use crate::ratelimit::rule::{AutoBlockPolicy, RateLimitRule};
use crate::ratelimit::types::{
    BlockEntry, Decision, DenyReason, RateLimitViolation, RequestDescriptor, RuleConfigError, ScopeKey,
    StoreUnavailable, ViolationAction, WindowCount, UNKNOWN_IP,
};

/// What a maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub counters: usize,
    pub blocks: usize,
    pub histories: usize,
}

/// Multi-window, multi-rule rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    rules: ArcSwap<RuleSet>,
    /// Serializes read-modify-write rule updates.
    update_lock: Mutex<()>,
    counters: Arc<dyn CounterStore>,
    blocks: BlockStore,
    /// Recent violation timestamps per (rule, scope), for auto-block.
    history: DashMap<(String, ScopeKey), VecDeque<DateTime<Utc>>>,
    sink: Arc<dyn AuditSink>,
    clock: SharedClock,
    enabled: AtomicBool,
}

/// A rule that was violated during one evaluation.
struct Violated {
    reason: DenyReason,
    retry_after: Duration,
}

impl RateLimiter {
    pub fn new(
        rules: RuleSet,
        counters: Arc<dyn CounterStore>,
        sink: Arc<dyn AuditSink>,
        clock: SharedClock,
    ) -> Self {
        Self {
            rules: ArcSwap::from_pointee(rules),
            update_lock: Mutex::new(()),
            counters,
            blocks: BlockStore::new(),
            history: DashMap::new(),
            sink,
            clock,
            enabled: AtomicBool::new(true),
        }
    }

    /// Decide whether a request may proceed.
    pub fn evaluate(&self, request: &RequestDescriptor) -> Decision {
        if !self.enabled.load(Ordering::Relaxed) {
            metrics::record_decision("allow");
            return Decision::Allow;
        }

        let now = self.clock.now();
        let rules = self.rules.load();
        let scoped: Vec<(&RateLimitRule, ScopeKey)> = rules
            .matching(&request.endpoint, &request.method)
            .into_iter()
            .map(|rule| (rule, rule.scope_key(request)))
            .collect();

        if scoped.is_empty() {
            metrics::record_decision("allow");
            return Decision::Allow;
        }

        if let Some(block) = self.find_block(&scoped, now) {
            tracing::debug!(
                rule = %block.rule_id,
                scope = %block.scope_key,
                endpoint = %request.endpoint,
                "Request denied by active block"
            );
            metrics::record_decision("blocked");
            return Decision::Deny {
                retry_after: block.remaining(now),
                reason: DenyReason::Blocked {
                    rule: block.rule_id,
                    expires_at: block.expires_at,
                },
            };
        }

        let mut denial: Option<Violated> = None;
        for (rule, scope) in &scoped {
            let Some(violated) = self.count_rule(rule, scope, request, now) else {
                continue;
            };
            // Rules arrive highest priority first; the first violation names the reason.
            denial = Some(match denial.take() {
                Some(first) => Violated {
                    reason: first.reason,
                    retry_after: first.retry_after.max(violated.retry_after),
                },
                None => violated,
            });
        }

        match denial {
            Some(Violated { reason, retry_after }) => {
                metrics::record_decision("deny");
                Decision::Deny { reason, retry_after }
            }
            None => {
                metrics::record_decision("allow");
                Decision::Allow
            }
        }
    }

    /// The longest-lived active block among the candidate scopes.
    fn find_block(&self, scoped: &[(&RateLimitRule, ScopeKey)], now: DateTime<Utc>) -> Option<BlockEntry> {
        scoped
            .iter()
            .filter_map(|(_, scope)| self.blocks.active(scope, now))
            .max_by_key(|block| block.expires_at)
    }

    /// Count one request against one rule. Returns the violation, if any.
    fn count_rule(
        &self,
        rule: &RateLimitRule,
        scope: &ScopeKey,
        request: &RequestDescriptor,
        now: DateTime<Utc>,
    ) -> Option<Violated> {
        let mut counts = Vec::with_capacity(3);
        for (granularity, limit) in rule.limits() {
            let key = CounterKey::new(&rule.name, scope, granularity, now);
            match self.counters.increment(&key) {
                Ok(count) => counts.push(WindowCount {
                    granularity,
                    window_start: key.window_start,
                    count,
                    limit,
                }),
                Err(e) => {
                    self.fail_open(rule, scope, request, &e);
                    return None;
                }
            }
        }

        let exceeded = counts.iter().find(|c| c.exceeded())?.clone();
        let window_wait = counts
            .iter()
            .filter(|c| c.exceeded())
            .map(|c| (c.granularity.window_end(now) - now).to_std().unwrap_or_default())
            .max()
            .unwrap_or_default();

        let block = rule
            .auto_block
            .as_ref()
            .and_then(|policy| self.escalate(rule, policy, scope, now));
        let action = if block.is_some() {
            ViolationAction::DeniedAndBlocked
        } else {
            ViolationAction::Denied
        };
        let retry_after = block
            .as_ref()
            .map_or(window_wait, |b| window_wait.max(b.remaining(now)));

        tracing::info!(
            rule = %rule.name,
            scope = %scope,
            endpoint = %request.endpoint,
            method = %request.method,
            granularity = %exceeded.granularity,
            count = exceeded.count,
            limit = exceeded.limit,
            action = action.as_str(),
            "Rate limit exceeded"
        );
        metrics::record_violation(&rule.name);

        let severity = if block.is_some() { Severity::High } else { Severity::Medium };
        let event = self
            .base_event(event_types::RATE_LIMIT_EXCEEDED, severity, request)
            .detail("rule", &rule.name)
            .detail("scope", scope)
            .detail("granularity", exceeded.granularity)
            .detail("count", exceeded.count)
            .detail("limit", exceeded.limit)
            .detail("counts", summarize(&counts))
            .detail("action", action.as_str());

        let violation = RateLimitViolation {
            rule_id: rule.name.clone(),
            scope_key: scope.clone(),
            endpoint: request.endpoint.clone(),
            method: request.method.clone(),
            timestamp: now,
            counts,
            action,
        };
        self.sink.submit(AuditJob::Violation { violation, event });

        if let Some(block) = &block {
            self.sink.submit(AuditJob::Event(
                self.base_event(event_types::RATE_LIMIT_BLOCK_CREATED, Severity::High, request)
                    .detail("rule", &block.rule_id)
                    .detail("scope", &block.scope_key)
                    .detail("reason", &block.reason)
                    .detail("expires_at", block.expires_at.to_rfc3339()),
            ));
        }

        Some(Violated {
            reason: DenyReason::RateLimited {
                rule: rule.name.clone(),
                granularity: exceeded.granularity,
                count: exceeded.count,
                limit: exceeded.limit,
            },
            retry_after,
        })
    }

    /// Record a violation for auto-block and create a block once the threshold is met.
    fn escalate(
        &self,
        rule: &RateLimitRule,
        policy: &AutoBlockPolicy,
        scope: &ScopeKey,
        now: DateTime<Utc>,
    ) -> Option<BlockEntry> {
        let cutoff = now
            .checked_sub_signed(seconds(policy.lookback_secs))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut history = self
            .history
            .entry((rule.name.clone(), scope.clone()))
            .or_default();
        while history.front().is_some_and(|t| *t <= cutoff) {
            history.pop_front();
        }
        history.push_back(now);
        if history.len() < policy.violation_threshold as usize {
            return None;
        }
        history.clear();
        drop(history);

        let block = BlockEntry {
            scope_key: scope.clone(),
            rule_id: rule.name.clone(),
            reason: format!(
                "{} violations of '{}' within {}s",
                policy.violation_threshold, rule.name, policy.lookback_secs
            ),
            created_at: now,
            expires_at: now
                .checked_add_signed(seconds(policy.block_duration_secs))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        tracing::warn!(
            rule = %rule.name,
            scope = %scope,
            expires_at = %block.expires_at.to_rfc3339(),
            "Auto-block created"
        );
        metrics::record_block_created(&rule.name);
        self.blocks.insert(block.clone());
        Some(block)
    }

    fn fail_open(&self, rule: &RateLimitRule, scope: &ScopeKey, request: &RequestDescriptor, error: &StoreUnavailable) {
        tracing::error!(
            critical = true,
            rule = %rule.name,
            scope = %scope,
            error = %error,
            "Counter store unavailable, allowing request"
        );
        metrics::record_store_unavailable(&rule.name);
        self.sink.submit(AuditJob::Event(
            self.base_event(event_types::RATE_LIMIT_STORE_UNAVAILABLE, Severity::Critical, request)
                .detail("rule", &rule.name)
                .detail("scope", scope)
                .detail("error", error),
        ));
    }

    fn base_event(&self, event_type: &str, severity: Severity, request: &RequestDescriptor) -> NewSecurityEvent {
        NewSecurityEvent::new(event_type, severity)
            .maybe_user(request.user_id.clone())
            .ip(request.ip.as_deref().unwrap_or(UNKNOWN_IP))
            .user_agent(request.user_agent.as_deref().unwrap_or_default())
            .detail("endpoint", &request.endpoint)
            .detail("method", &request.method)
    }

    /// Current rule snapshot.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }

    /// Replace every rule. The old set stays live if validation fails.
    pub fn replace_rules(&self, rules: Vec<RateLimitRule>) -> Result<(), RuleConfigError> {
        let compiled = RuleSet::compile(rules)?;
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(rules = compiled.len(), "Rate limit rules replaced");
        self.rules.store(Arc::new(compiled));
        Ok(())
    }

    /// Insert a rule, or replace the rule with the same name.
    pub fn upsert_rule(&self, rule: RateLimitRule) -> Result<(), RuleConfigError> {
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let name = rule.name.clone();
        let mut rules: Vec<RateLimitRule> = self
            .rules
            .load()
            .rules()
            .iter()
            .filter(|r| r.name != rule.name)
            .cloned()
            .collect();
        rules.push(rule);

        self.rules.store(Arc::new(RuleSet::compile(rules)?));
        tracing::info!(rule = %name, "Rate limit rule upserted");
        Ok(())
    }

    /// Remove a rule by name. Returns false if no such rule exists.
    pub fn remove_rule(&self, name: &str) -> Result<bool, RuleConfigError> {
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.rules.load();
        if current.get(name).is_none() {
            return Ok(false);
        }
        let rules = current.rules().iter().filter(|r| r.name != name).cloned().collect();

        self.rules.store(Arc::new(RuleSet::compile(rules)?));
        tracing::info!(rule = %name, "Rate limit rule removed");
        Ok(true)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        tracing::info!(enabled, "Rate limiting toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Current window counts for a rule and scope, without counting a request.
    pub fn usage(&self, rule_name: &str, scope: &ScopeKey) -> Result<Vec<WindowCount>, StoreUnavailable> {
        let now = self.clock.now();
        let rules = self.rules.load();
        let Some(rule) = rules.get(rule_name) else {
            return Ok(Vec::new());
        };

        rule.limits()
            .map(|(granularity, limit)| {
                let key = CounterKey::new(&rule.name, scope, granularity, now);
                Ok(WindowCount {
                    granularity,
                    window_start: key.window_start,
                    count: self.counters.get(&key)?,
                    limit,
                })
            })
            .collect()
    }

    /// Lift a block early.
    pub fn unblock(&self, scope: &ScopeKey) -> Option<BlockEntry> {
        let removed = self.blocks.remove(scope);
        if let Some(block) = &removed {
            tracing::info!(rule = %block.rule_id, scope = %scope, "Block lifted");
        }
        removed
    }

    pub fn active_blocks(&self) -> Vec<BlockEntry> {
        self.blocks.list_active(self.clock.now())
    }

    /// Drop ended windows, expired blocks and stale violation history.
    pub fn prune(&self) -> PruneStats {
        let now = self.clock.now();
        let rules = self.rules.load();

        let counters = self.counters.prune(now);
        let blocks = self.blocks.purge_expired(now);

        let before = self.history.len();
        self.history.retain(|(rule_name, _), history| {
            let Some(policy) = rules.get(rule_name).and_then(|r| r.auto_block.as_ref()) else {
                return false;
            };
            let cutoff = now
                .checked_sub_signed(seconds(policy.lookback_secs))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            while history.front().is_some_and(|t| *t <= cutoff) {
                history.pop_front();
            }
            !history.is_empty()
        });
        let histories = before.saturating_sub(self.history.len());

        metrics::record_active_blocks(self.blocks.len());
        tracing::debug!(counters, blocks, histories, "Rate limiter pruned");
        PruneStats {
            counters,
            blocks,
            histories,
        }
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX)).unwrap_or(chrono::Duration::MAX)
}

fn summarize(counts: &[WindowCount]) -> String {
    counts
        .iter()
        .map(|c| format!("{}={}/{}", c.granularity, c.count, c.limit))
        .collect::<Vec<_>>()
        .join(",")
}
