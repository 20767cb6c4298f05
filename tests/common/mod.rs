//! Shared fixtures for integration tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use security_substrate::audit::{EventRecorder, InMemoryEventStore, InlineSink};
use security_substrate::clock::MockClock;
use security_substrate::ratelimit::{InMemoryCounterStore, RateLimitRule, RateLimiter, RuleSet};
use security_substrate::resilience::RetryPolicy;
use security_substrate::violations::ViolationTracker;

/// 10:00:30 UTC, half way through a minute window.
pub fn mid_minute() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 2, 10, 0, 30).unwrap()
}

/// A limiter writing audit jobs inline, with handles to everything it touches.
#[allow(dead_code)]
pub struct LimiterFixture {
    pub limiter: RateLimiter,
    pub recorder: Arc<EventRecorder>,
    pub violations: Arc<ViolationTracker>,
    pub clock: Arc<MockClock>,
}

#[allow(dead_code)]
pub fn limiter_with(rules: Vec<RateLimitRule>) -> LimiterFixture {
    let clock = Arc::new(MockClock::new(mid_minute()));
    let recorder = Arc::new(
        EventRecorder::open(Arc::new(InMemoryEventStore::new()), clock.clone(), RetryPolicy::no_retry())
            .unwrap(),
    );
    let violations = Arc::new(ViolationTracker::in_memory());
    let limiter = RateLimiter::new(
        RuleSet::compile(rules).unwrap(),
        Arc::new(InMemoryCounterStore::new()),
        Arc::new(InlineSink::new(recorder.clone(), violations.clone())),
        clock.clone(),
    );

    LimiterFixture {
        limiter,
        recorder,
        violations,
        clock,
    }
}

/// `10/min, 50/hr, 200/day` on the auth endpoints, per IP.
#[allow(dead_code)]
pub fn auth_rule() -> RateLimitRule {
    RateLimitRule::new("auth", "/api/auth/.*")
        .method("POST")
        .per_minute(10)
        .per_hour(50)
        .per_day(200)
        .ip_scoped()
}
