//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Rules: patterns compile, limits positive, names unique
//! - Vault: versions unique, material present, active version exists
//! - Audit/retry value ranges
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Pure function: SecurityConfig → Result<(), Vec<ValidationError>>
//! - Runs before a config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::SecurityConfig;
use crate::ratelimit::RuleConfigError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0}")]
    Rule(#[from] RuleConfigError),

    #[error("vault key version {0} is configured more than once")]
    DuplicateKeyVersion(u32),

    #[error("vault key version {0} has neither material nor material_env")]
    MissingKeyMaterial(u32),

    #[error("vault key version 0 is reserved")]
    ZeroKeyVersion,

    #[error("vault active_version {0} is not among the configured keys")]
    UnknownActiveVersion(u32),

    #[error("audit channel_capacity must be positive")]
    ZeroChannelCapacity,

    #[error("retries.max_attempts must be positive")]
    ZeroRetryAttempts,

    #[error("retries.base_delay_ms ({base}) exceeds max_delay_ms ({max})")]
    InvalidRetryDelays { base: u64, max: u64 },

    #[error("rate_limit.prune_interval_secs must be positive")]
    ZeroPruneInterval,
}

/// Validate a parsed configuration, collecting every problem.
pub fn validate_config(config: &SecurityConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut names = HashSet::new();
    for rule in &config.rate_limit.rules {
        if let Err(e) = rule.validate() {
            errors.push(e.into());
        } else if !names.insert(rule.name.as_str()) {
            errors.push(RuleConfigError::DuplicateRule(rule.name.clone()).into());
        }
    }
    if config.rate_limit.prune_interval_secs == 0 {
        errors.push(ValidationError::ZeroPruneInterval);
    }

    let mut versions = HashSet::new();
    for key in &config.vault.keys {
        if key.version == 0 {
            errors.push(ValidationError::ZeroKeyVersion);
        }
        if !versions.insert(key.version) {
            errors.push(ValidationError::DuplicateKeyVersion(key.version));
        }
        if key.material.is_none() && key.material_env.is_none() {
            errors.push(ValidationError::MissingKeyMaterial(key.version));
        }
    }
    if let Some(active) = config.vault.active_version {
        if !versions.contains(&active) {
            errors.push(ValidationError::UnknownActiveVersion(active));
        }
    }

    if config.audit.channel_capacity == 0 {
        errors.push(ValidationError::ZeroChannelCapacity);
    }
    if config.retries.max_attempts == 0 {
        errors.push(ValidationError::ZeroRetryAttempts);
    }
    if config.retries.base_delay_ms > config.retries.max_delay_ms {
        errors.push(ValidationError::InvalidRetryDelays {
            base: config.retries.base_delay_ms,
            max: config.retries.max_delay_ms,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
