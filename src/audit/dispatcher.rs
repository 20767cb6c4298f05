//! Decoupling of audit writes from the request path.
//!
//! # Data Flow
//! ```text
//! RateLimiter::evaluate (deny)
//!     → AuditSink::submit(AuditJob)          never blocks
//!         InlineSink:  write immediately (tests, tools)
//!         ChannelSink: try_send on a bounded queue
//!     → AuditDispatcher::run (tokio task)
//!     → spawn_blocking: EventRecorder::log + ViolationTracker::record
//! ```
//!
//! # Design Decisions
//! - A full or closed queue is escalated (error log + metric), never waited on
//! - Shutdown drains everything already queued before the task exits

use std::fmt::Debug;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::audit::recorder::EventRecorder;
use crate::audit::types::NewSecurityEvent;
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::ratelimit::RateLimitViolation;
use crate::violations::ViolationTracker;

/// A unit of audit work produced on the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditJob {
    Event(NewSecurityEvent),
    Violation {
        violation: RateLimitViolation,
        event: NewSecurityEvent,
    },
}

/// Receiver of audit work. Implementations must not block the caller on I/O
/// backpressure beyond what they document.
pub trait AuditSink: Send + Sync + Debug {
    fn submit(&self, job: AuditJob);
}

/// Write a job to the recorder and tracker, logging failures.
pub fn process_job(job: AuditJob, recorder: &EventRecorder, violations: &ViolationTracker) {
    let event = match job {
        AuditJob::Event(event) => event,
        AuditJob::Violation { violation, event } => {
            if let Err(e) = violations.record(violation) {
                tracing::error!(critical = true, error = %e, "Rate limit violation could not be persisted");
            }
            event
        }
    };
    // Escalation already happened inside the recorder.
    let _ = recorder.log(event);
}

/// Processes jobs synchronously on the calling thread.
#[derive(Debug, Clone)]
pub struct InlineSink {
    recorder: Arc<EventRecorder>,
    violations: Arc<ViolationTracker>,
}

impl InlineSink {
    pub fn new(recorder: Arc<EventRecorder>, violations: Arc<ViolationTracker>) -> Self {
        Self { recorder, violations }
    }
}

impl AuditSink for InlineSink {
    fn submit(&self, job: AuditJob) {
        process_job(job, &self.recorder, &self.violations);
    }
}

/// Hands jobs to an [`AuditDispatcher`] through a bounded queue.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<AuditJob>,
}

impl AuditSink for ChannelSink {
    fn submit(&self, job: AuditJob) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                metrics::record_audit_dropped("queue_full");
                tracing::error!(critical = true, job = ?job, "Audit queue full, security event dropped");
            }
            Err(TrySendError::Closed(job)) => {
                metrics::record_audit_dropped("queue_closed");
                tracing::error!(critical = true, job = ?job, "Audit dispatcher stopped, security event dropped");
            }
        }
    }
}

/// Background writer draining a [`ChannelSink`].
#[derive(Debug)]
pub struct AuditDispatcher {
    rx: mpsc::Receiver<AuditJob>,
    recorder: Arc<EventRecorder>,
    violations: Arc<ViolationTracker>,
}

/// Create a connected sink/dispatcher pair.
pub fn audit_channel(
    capacity: usize,
    recorder: Arc<EventRecorder>,
    violations: Arc<ViolationTracker>,
) -> (ChannelSink, AuditDispatcher) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ChannelSink { tx },
        AuditDispatcher {
            rx,
            recorder,
            violations,
        },
    )
}

impl AuditDispatcher {
    /// Run until shutdown is signalled or every sink is dropped.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        tracing::info!("Audit dispatcher starting");
        loop {
            tokio::select! {
                job = self.rx.recv() => match job {
                    Some(job) => self.write(job).await,
                    None => break,
                },
                _ = shutdown.recv() => {
                    self.rx.close();
                    let mut drained = 0usize;
                    while let Some(job) = self.rx.recv().await {
                        self.write(job).await;
                        drained += 1;
                    }
                    tracing::info!(drained, "Audit dispatcher drained queue on shutdown");
                    break;
                }
            }
        }
        tracing::info!("Audit dispatcher stopped");
    }

    async fn write(&self, job: AuditJob) {
        let recorder = self.recorder.clone();
        let violations = self.violations.clone();
        // Persistence retries sleep; keep them off the async workers.
        if let Err(e) = tokio::task::spawn_blocking(move || process_job(job, &recorder, &violations)).await {
            tracing::error!(critical = true, error = %e, "Audit write task panicked");
            metrics::record_audit_failure("writer_panicked");
        }
    }
}
