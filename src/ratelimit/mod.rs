//! Rate limiting subsystem.
//!
//! # Data Flow
//! ```text
//! Rules (config / CRUD)
//!     → rule.rs (validation)
//!     → matcher.rs (RegexSet compiled once per update)
//!     → limiter.rs (ArcSwap'd live set)
//!
//! Request
//!     → limiter.rs → block.rs (active blocks)
//!                  → counter.rs (fixed-window counters)
//!                  → AuditSink (violations, block creation)
//! ```
//!
//! # Design Decisions
//! - Multiple matching rules: most restrictive wins
//! - Scope keys fall back to `anonymous` / `unknown` when user or IP is missing
//! - The counter store is injected; the in-memory store is the default

pub mod block;
pub mod counter;
pub mod limiter;
pub mod matcher;
pub mod rule;
pub mod types;

pub use block::BlockStore;
pub use counter::{CounterKey, CounterStore, InMemoryCounterStore};
pub use limiter::{PruneStats, RateLimiter};
pub use matcher::RuleSet;
pub use rule::{AutoBlockPolicy, RateLimitRule, ANY_METHOD};
pub use types::{
    BlockEntry, Decision, DenyReason, Granularity, RateLimitViolation, RequestDescriptor, RuleConfigError, ScopeKey,
    StoreUnavailable, ViolationAction, WindowCount, ANONYMOUS_USER, UNKNOWN_IP,
};
