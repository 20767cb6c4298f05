//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters and gauges via `metrics`)
//!
//! Consumers:
//!     → Log aggregation (stderr, text or JSON)
//!     → Whatever metrics recorder the host application installs
//! ```
//!
//! # Design Decisions
//! - Structured fields (`rule`, `scope`, `sequence`, `key_version`) instead of
//!   interpolated messages
//! - Critical conditions (audit persistence exhausted, counter store down)
//!   are logged at `error` level and counted, never swallowed

pub mod logging;
pub mod metrics;
