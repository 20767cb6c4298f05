//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Durable write (audit log, violation log):
//!     → retries.rs (run the write, retry on failure)
//!     → backoff.rs (exponential delay + jitter between attempts)
//!     → exhausted: error returned to caller, which escalates
//! ```
//!
//! # Design Decisions
//! - Retries are bounded; there is no infinite retry loop
//! - Jittered backoff avoids synchronized retries across workers

pub mod backoff;
pub mod retries;

pub use backoff::{calculate_backoff, RetryPolicy};
pub use retries::{retry_blocking, RetryExhausted};
