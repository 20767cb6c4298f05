//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the security
//! core. All types derive Serde traits for deserialization from TOML files.

use std::fmt;

use serde::{Deserialize, Serialize};

pub use crate::ratelimit::rule::{AutoBlockPolicy, RateLimitRule};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Rate limiting rules and maintenance.
    pub rate_limit: RateLimitConfig,

    /// Field encryption key material.
    pub vault: VaultConfig,

    /// Audit log and violation persistence.
    pub audit: AuditConfig,

    /// Retry policy for audit persistence.
    pub retries: RetryConfig,

    /// Dashboard rollup settings.
    pub metrics: MetricsConfig,

    /// Logging settings.
    pub observability: ObservabilityConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// When false every request is allowed and no counters are kept.
    pub enabled: bool,

    /// Rule definitions.
    pub rules: Vec<RateLimitRule>,

    /// Interval for pruning ended windows and expired blocks, in seconds.
    pub prune_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
            prune_interval_secs: 300,
        }
    }
}

/// Key ring configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct VaultConfig {
    /// Version used for new writes. Defaults to the highest configured version.
    pub active_version: Option<u32>,

    /// All key versions, including retired ones still needed for reads.
    pub keys: Vec<KeyConfig>,
}

/// One key version. Material is base64 of 32 bytes, inline or from an env var.
#[derive(Clone, Deserialize, Serialize, PartialEq)]
pub struct KeyConfig {
    pub version: u32,

    #[serde(default)]
    pub material: Option<String>,

    /// Environment variable holding the base64 material.
    #[serde(default)]
    pub material_env: Option<String>,
}

impl fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyConfig")
            .field("version", &self.version)
            .field("material", &self.material.as_ref().map(|_| "<redacted>"))
            .field("material_env", &self.material_env)
            .finish()
    }
}

/// Audit configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines audit log. In-memory when unset.
    pub log_path: Option<String>,

    /// JSON-lines violation log. In-memory when unset.
    pub violations_path: Option<String>,

    /// Capacity of the queue between the limiter and the audit writer.
    pub channel_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            violations_path: None,
            channel_capacity: 1024,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1000,
        }
    }
}

/// Rollup configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// How long a computed snapshot is served from cache.
    pub snapshot_ttl_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { snapshot_ttl_secs: 30 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
