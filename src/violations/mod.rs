//! Rate limit violation tracking.
//!
//! Purely additive: records are appended by the audit dispatcher and read by
//! the rollup aggregator and admin tooling.

pub mod tracker;

pub use tracker::{ViolationError, ViolationFilter, ViolationRecord, ViolationTracker};
