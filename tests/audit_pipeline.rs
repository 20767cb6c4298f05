//! Audit pipeline: background dispatch, durable reload, tamper detection and rollups.

use std::fs;
use std::sync::Arc;

use security_substrate::audit::{
    audit_channel, event_types, AuditError, AuditJob, AuditSink, EventQuery, EventRecorder, InMemoryEventStore,
    JsonlEventStore, NewSecurityEvent, Severity,
};
use security_substrate::clock::{Clock, MockClock, SystemClock};
use security_substrate::config::{parse_config, SecurityConfig};
use security_substrate::lifecycle::Shutdown;
use security_substrate::ratelimit::RequestDescriptor;
use security_substrate::resilience::RetryPolicy;
use security_substrate::violations::ViolationTracker;
use security_substrate::SecurityEngine;

mod common;

fn recorder() -> Arc<EventRecorder> {
    Arc::new(
        EventRecorder::open(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(SystemClock::new()),
            RetryPolicy::no_retry(),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn test_dispatcher_drains_queue_on_shutdown() {
    let recorder = recorder();
    let violations = Arc::new(ViolationTracker::in_memory());
    let (sink, dispatcher) = audit_channel(64, recorder.clone(), violations.clone());

    let shutdown = Shutdown::new();
    let handle = tokio::spawn(dispatcher.run(shutdown.subscribe()));

    for n in 0..20 {
        sink.submit(AuditJob::Event(
            NewSecurityEvent::new(event_types::LOGIN_FAILED, Severity::Medium)
                .user(format!("user-{}", n))
                .ip("192.0.2.10"),
        ));
    }
    shutdown.trigger();
    handle.await.unwrap();

    assert_eq!(recorder.len(), 20);
    recorder.verify().unwrap();
    assert_eq!(
        recorder.count_events(&EventQuery::default().user("user-7")),
        1
    );
}

#[tokio::test]
async fn test_full_queue_drops_instead_of_blocking() {
    let recorder = recorder();
    let (sink, dispatcher) = audit_channel(2, recorder.clone(), Arc::new(ViolationTracker::in_memory()));

    // Nothing drains yet, so only the first two fit.
    for _ in 0..5 {
        sink.submit(AuditJob::Event(NewSecurityEvent::new("probe", Severity::Low)));
    }

    let shutdown = Shutdown::new();
    let handle = tokio::spawn(dispatcher.run(shutdown.subscribe()));
    shutdown.trigger();
    handle.await.unwrap();

    assert_eq!(recorder.len(), 2);
}

#[test]
fn test_jsonl_log_reloads_and_detects_tampering() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit").join("events.jsonl");

    {
        let store = Arc::new(JsonlEventStore::open(&path).unwrap());
        let recorder = EventRecorder::open(store, Arc::new(SystemClock::new()), RetryPolicy::no_retry()).unwrap();
        for n in 0..3 {
            recorder
                .log(NewSecurityEvent::new(event_types::LOGIN_FAILED, Severity::Medium).detail("attempt", n))
                .unwrap();
        }
    }

    let store = Arc::new(JsonlEventStore::open(&path).unwrap());
    let reopened = EventRecorder::open(store, Arc::new(SystemClock::new()), RetryPolicy::no_retry()).unwrap();
    assert_eq!(reopened.len(), 3);
    assert_eq!(reopened.log(NewSecurityEvent::new("after_restart", Severity::Low)).unwrap(), 4);
    drop(reopened);

    // Rewrite one field of the second event.
    let content = fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let mut event: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    event["ip"] = serde_json::Value::String("10.6.6.6".into());
    lines[1] = event.to_string();
    fs::write(&path, lines.join("\n") + "\n").unwrap();

    let store = Arc::new(JsonlEventStore::open(&path).unwrap());
    let err = EventRecorder::open(store, Arc::new(SystemClock::new()), RetryPolicy::no_retry()).unwrap_err();
    assert!(matches!(err, AuditError::ChainBroken { sequence: 2, .. }));
}

#[test]
fn test_rate_limit_denials_feed_the_rollup() {
    let f = common::limiter_with(vec![common::auth_rule()]);
    for _ in 0..12 {
        f.limiter
            .evaluate(&RequestDescriptor::new("/api/auth/login", "POST").with_ip("203.0.113.9"));
    }

    assert_eq!(f.violations.count_since(common::mid_minute()), 2);
    assert_eq!(f.recorder.len(), 2);

    // Events older than 24h fall out of the daily count.
    f.clock.advance(chrono::Duration::hours(25));
    assert_eq!(
        f.violations
            .count_since(f.clock.now() - chrono::Duration::hours(24)),
        0
    );
}

#[tokio::test]
async fn test_engine_snapshot_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = format!(
        r#"
        [audit]
        log_path = "{}"
        violations_path = "{}"

        [[rate_limit.rules]]
        name = "auth"
        endpoint_pattern = "/api/auth/.*"
        method = "POST"
        per_minute = 2
        ip_scoped = true
        "#,
        dir.path().join("events.jsonl").display(),
        dir.path().join("violations.jsonl").display(),
    );
    let config: SecurityConfig = parse_config(&config).unwrap();

    let clock = Arc::new(MockClock::new(common::mid_minute()));
    let mut engine = SecurityEngine::from_config(config, clock.clone()).unwrap();
    let shutdown = Shutdown::new();
    let handles = engine.start(&shutdown);

    let login = RequestDescriptor::new("/api/auth/login", "POST").with_ip("198.51.100.3");
    for _ in 0..4 {
        engine.evaluate(&login);
    }
    engine.pending_requests().opened();
    engine
        .log_event(NewSecurityEvent::new(event_types::LOGIN_FAILED, Severity::Medium).ip("198.51.100.3"))
        .unwrap();
    engine
        .log_event(NewSecurityEvent::new("privilege_escalation", Severity::Critical))
        .unwrap();

    shutdown.trigger();
    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot = engine.metrics().refresh();
    assert_eq!(snapshot.rate_limit_violations_24h, 2);
    assert_eq!(snapshot.failed_logins_24h, 1);
    assert_eq!(snapshot.audit_events_24h, 4);
    assert_eq!(snapshot.gdpr_requests_pending, 1);
    assert_eq!(snapshot.critical_events_7d, 1);
    assert_eq!(snapshot.high_severity_events_7d, 0);

    let json = serde_json::to_value(snapshot).unwrap();
    assert_eq!(json.as_object().unwrap().len(), 6);

    // Everything written survives a restart.
    drop(engine);
    let reopened = SecurityEngine::from_config(
        parse_config(&format!(
            "[audit]\nlog_path = \"{}\"\nviolations_path = \"{}\"\n",
            dir.path().join("events.jsonl").display(),
            dir.path().join("violations.jsonl").display(),
        ))
        .unwrap(),
        clock,
    )
    .unwrap();
    assert_eq!(reopened.recorder().len(), 4);
    assert_eq!(reopened.violations().len(), 2);
}
