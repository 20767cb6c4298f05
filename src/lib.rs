//! Security enforcement substrate.
//!
//! # Architecture Overview
//!
//! ```text
//!     RequestDescriptor
//!     ─────────────────▶ ratelimit::RateLimiter ──deny──▶ audit::AuditSink
//!                              │                              │
//!                              ▼                              ▼
//!                          Decision              audit::EventRecorder (hash chain)
//!                                                violations::ViolationTracker
//!                                                              │
//!     plaintext                                                ▼
//!     ─────────────────▶ vault::EncryptionVault      rollup::MetricsAggregator
//!                        (AES-256-GCM, key ring)         (24h / 7d snapshot)
//!
//!     Cross-cutting: config (TOML + hot reload), observability (tracing, metrics),
//!     resilience (retry/backoff), lifecycle (shutdown), clock (injectable time)
//! ```
//!
//! [`engine::SecurityEngine`] wires everything from one validated
//! [`config::SecurityConfig`].

pub mod audit;
pub mod clock;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod observability;
pub mod ratelimit;
pub mod resilience;
pub mod rollup;
pub mod storage;
pub mod vault;
pub mod violations;

pub use audit::{EventRecorder, NewSecurityEvent, SecurityEvent, Severity};
pub use config::SecurityConfig;
pub use engine::{EngineError, SecurityEngine};
pub use lifecycle::Shutdown;
pub use ratelimit::{Decision, RateLimiter, RequestDescriptor};
pub use rollup::{MetricsAggregator, MetricsSnapshot};
pub use vault::EncryptionVault;
pub use violations::ViolationTracker;
