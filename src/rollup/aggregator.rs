//! Dashboard rollups over the audit log and violation history.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{event_types, EventQuery, EventRecorder, Severity};
use crate::clock::SharedClock;
use crate::observability::metrics;
use crate::rollup::pending::PendingRequestSource;
use crate::violations::ViolationTracker;

/// Point-in-time security counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub audit_events_24h: u64,
    pub failed_logins_24h: u64,
    pub rate_limit_violations_24h: u64,
    pub gdpr_requests_pending: u64,
    pub critical_events_7d: u64,
    pub high_severity_events_7d: u64,
}

/// Pull-based aggregator with a TTL cache.
#[derive(Debug)]
pub struct MetricsAggregator {
    recorder: Arc<EventRecorder>,
    violations: Arc<ViolationTracker>,
    pending: Arc<dyn PendingRequestSource>,
    clock: SharedClock,
    ttl: Duration,
    cache: Mutex<Option<(DateTime<Utc>, MetricsSnapshot)>>,
}

impl MetricsAggregator {
    pub fn new(
        recorder: Arc<EventRecorder>,
        violations: Arc<ViolationTracker>,
        pending: Arc<dyn PendingRequestSource>,
        clock: SharedClock,
        ttl: Duration,
    ) -> Self {
        Self {
            recorder,
            violations,
            pending,
            clock,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Cached snapshot, recomputed once older than the TTL.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = self.clock.now();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((computed_at, snapshot)) = *cache {
            let age = (now - computed_at).to_std().unwrap_or_default();
            if age < self.ttl {
                return snapshot;
            }
        }

        let snapshot = self.compute(now);
        *cache = Some((now, snapshot));
        snapshot
    }

    /// Recompute now, replacing the cached value.
    pub fn refresh(&self) -> MetricsSnapshot {
        let now = self.clock.now();
        let snapshot = self.compute(now);
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = Some((now, snapshot));
        snapshot
    }

    fn compute(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let day_ago = now - chrono::Duration::hours(24);
        let week_ago = now - chrono::Duration::days(7);
        let events = |query: EventQuery| self.recorder.count_events(&query) as u64;

        let snapshot = MetricsSnapshot {
            audit_events_24h: events(EventQuery::default().since(day_ago)),
            failed_logins_24h: events(
                EventQuery::default()
                    .since(day_ago)
                    .event_type(event_types::LOGIN_FAILED),
            ),
            rate_limit_violations_24h: self.violations.count_since(day_ago) as u64,
            gdpr_requests_pending: self.pending.pending(),
            critical_events_7d: events(EventQuery::default().since(week_ago).severity(Severity::Critical)),
            high_severity_events_7d: events(EventQuery::default().since(week_ago).severity(Severity::High)),
        };

        metrics::record_rollup_refresh();
        tracing::debug!(?snapshot, "Security rollup computed");
        snapshot
    }
}
