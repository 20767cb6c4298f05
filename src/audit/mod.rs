//! Tamper-evident security event log.
//!
//! # Data Flow
//! ```text
//! NewSecurityEvent
//!     → recorder.rs (assign sequence + timestamp under the append lock)
//!     → chain.rs (link prev_hash, compute SHA-256 hash)
//!     → store.rs (durable append, retried with backoff)
//!     → in-memory index (visible to queries only after durable success)
//!
//! Deny path of the rate limiter:
//!     → dispatcher.rs (AuditSink, bounded queue, background writer)
//! ```
//!
//! # Design Decisions
//! - One lock serializes sequence assignment and append; no two events share
//!   a sequence number and no partial record is ever readable
//! - Exhausted retries are escalated as critical, never silently dropped
//! - Retention is not managed here; the log only grows

pub mod chain;
pub mod dispatcher;
pub mod recorder;
pub mod store;
pub mod types;

pub use chain::{compute_hash, verify_chain, GENESIS_HASH};
pub use dispatcher::{audit_channel, process_job, AuditDispatcher, AuditJob, AuditSink, ChannelSink, InlineSink};
pub use recorder::EventRecorder;
pub use store::{EventStore, InMemoryEventStore, JsonlEventStore};
pub use types::{event_types, AuditError, AuditResult, EventQuery, NewSecurityEvent, SecurityEvent, Severity};
