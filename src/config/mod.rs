//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, all errors collected)
//!     → SecurityConfig (validated, immutable)
//!     → SecurityEngine::from_config builds every subsystem
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → SecurityEngine::apply_config swaps the compiled rule set atomically
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Only rate limit rules are hot-reloadable; key material and storage
//!   paths require a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AuditConfig, KeyConfig, MetricsConfig, ObservabilityConfig, RateLimitConfig, RetryConfig, SecurityConfig,
    VaultConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
