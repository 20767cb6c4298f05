//! Security metrics rollups.
//!
//! Computed on demand from the audit log index and violation history, then
//! cached for a short TTL so dashboards polling at high rates do not rescan.

pub mod aggregator;
pub mod pending;

pub use aggregator::{MetricsAggregator, MetricsSnapshot};
pub use pending::{PendingRequestCounter, PendingRequestSource};
