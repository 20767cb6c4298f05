//! Engine wiring.
//!
//! # Responsibilities
//! - Build every subsystem from one validated [`SecurityConfig`]
//! - Spawn the background tasks (audit dispatcher, prune loop, config reload)
//! - Route side effects that span subsystems, such as auditing a failed
//!   decryption or a key rotation
//!
//! # Data Flow
//! ```text
//! SecurityConfig
//!     → EventRecorder (JSONL or in-memory) ─┐
//!     → ViolationTracker ───────────────────┼→ audit_channel → AuditDispatcher task
//!     → RateLimiter (ChannelSink) ──────────┘
//!     → KeyRing → EncryptionVault
//!     → MetricsAggregator
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::audit::{
    audit_channel, event_types, AuditDispatcher, AuditError, AuditResult, EventRecorder, EventStore,
    InMemoryEventStore, JsonlEventStore, NewSecurityEvent, Severity,
};
use crate::clock::SharedClock;
use crate::config::{validate_config, ConfigError, ConfigWatcher, SecurityConfig};
use crate::lifecycle::Shutdown;
use crate::ratelimit::{Decision, InMemoryCounterStore, RateLimiter, RequestDescriptor, RuleConfigError, RuleSet};
use crate::resilience::RetryPolicy;
use crate::rollup::{MetricsAggregator, MetricsSnapshot, PendingRequestCounter};
use crate::storage::JsonlError;
use crate::vault::{
    CellAddress, EncryptedFieldRecord, EncryptionVault, FieldStore, InMemoryFieldStore, KeyMaterial, KeyRing, VaultError,
    VaultResult,
};
use crate::violations::{ViolationError, ViolationTracker};

/// Errors raised while assembling the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid rate limit rules: {0}")]
    Rules(#[from] RuleConfigError),

    #[error("audit log: {0}")]
    Audit(#[from] AuditError),

    #[error("audit store: {0}")]
    Store(#[from] JsonlError),

    #[error("violation log: {0}")]
    Violations(#[from] ViolationError),

    #[error("key ring: {0}")]
    Vault(#[from] VaultError),
}

/// Every security subsystem behind one handle.
#[derive(Debug)]
pub struct SecurityEngine {
    config: SecurityConfig,
    recorder: Arc<EventRecorder>,
    violations: Arc<ViolationTracker>,
    limiter: Arc<RateLimiter>,
    vault: Arc<EncryptionVault>,
    aggregator: Arc<MetricsAggregator>,
    pending: Arc<PendingRequestCounter>,
    dispatcher: Option<AuditDispatcher>,
}

impl SecurityEngine {
    /// Validate the configuration and construct all subsystems.
    ///
    /// Nothing runs until [`SecurityEngine::start`]; deny-side audit jobs
    /// queue up (bounded) in the meantime.
    pub fn from_config(config: SecurityConfig, clock: SharedClock) -> Result<Self, EngineError> {
        Self::with_field_store(config, clock, Arc::new(InMemoryFieldStore::new()))
    }

    /// Like [`SecurityEngine::from_config`], with encrypted cells kept in `fields`.
    pub fn with_field_store(
        config: SecurityConfig,
        clock: SharedClock,
        fields: Arc<dyn FieldStore>,
    ) -> Result<Self, EngineError> {
        validate_config(&config).map_err(ConfigError::Validation)?;
        let retry = RetryPolicy::from(&config.retries);

        let store: Arc<dyn EventStore> = match &config.audit.log_path {
            Some(path) => Arc::new(JsonlEventStore::open(path)?),
            None => Arc::new(InMemoryEventStore::new()),
        };
        let recorder = Arc::new(EventRecorder::open(store, clock.clone(), retry)?);

        let violations = Arc::new(match &config.audit.violations_path {
            Some(path) => ViolationTracker::open(path, retry)?,
            None => ViolationTracker::in_memory(),
        });

        let (sink, dispatcher) = audit_channel(config.audit.channel_capacity, recorder.clone(), violations.clone());

        let limiter = Arc::new(RateLimiter::new(
            RuleSet::compile(config.rate_limit.rules.clone())?,
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(sink),
            clock.clone(),
        ));
        limiter.set_enabled(config.rate_limit.enabled);

        let vault = Arc::new(EncryptionVault::new(
            KeyRing::from_config(&config.vault)?,
            fields,
            clock.clone(),
        ));

        let pending = Arc::new(PendingRequestCounter::new());
        let aggregator = Arc::new(MetricsAggregator::new(
            recorder.clone(),
            violations.clone(),
            pending.clone(),
            clock,
            Duration::from_secs(config.metrics.snapshot_ttl_secs),
        ));

        tracing::info!(
            rules = config.rate_limit.rules.len(),
            audit_events = recorder.len(),
            violations = violations.len(),
            key_version = ?vault.active_key_version(),
            "Security engine initialized"
        );

        Ok(Self {
            config,
            recorder,
            violations,
            limiter,
            vault,
            aggregator,
            pending,
            dispatcher: Some(dispatcher),
        })
    }

    /// Spawn the audit dispatcher and the prune loop. Must run inside a tokio runtime.
    ///
    /// Calling it twice only spawns a second prune loop; the dispatcher runs once.
    pub fn start(&mut self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        if let Some(dispatcher) = self.dispatcher.take() {
            handles.push(tokio::spawn(dispatcher.run(shutdown.subscribe())));
        }

        let limiter = self.limiter.clone();
        let period = Duration::from_secs(self.config.rate_limit.prune_interval_secs.max(1));
        let mut signal = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        limiter.prune();
                    }
                    _ = signal.recv() => break,
                }
            }
            tracing::debug!("Prune loop stopped");
        }));

        tracing::info!("Security engine started");
        handles
    }

    /// Apply the hot-reloadable parts of a new configuration.
    ///
    /// Only rate limit rules and the enabled flag are swapped; a rule error
    /// keeps the current rules live.
    pub fn apply_config(&self, config: &SecurityConfig) -> Result<(), RuleConfigError> {
        apply_rate_limit_config(&self.limiter, config)
    }

    /// Watch a config file and apply every validated change until shutdown.
    pub fn watch_config(&self, path: &Path, shutdown: &Shutdown) -> Result<JoinHandle<()>, notify::Error> {
        let (watcher, mut updates) = ConfigWatcher::new(path);
        let guard = watcher.run()?;
        let limiter = self.limiter.clone();
        let mut signal = shutdown.subscribe();

        Ok(tokio::spawn(async move {
            let _guard = guard;
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(config) => {
                            if let Err(e) = apply_rate_limit_config(&limiter, &config) {
                                tracing::error!(error = %e, "Rejected reloaded rules, keeping current set");
                            }
                        }
                        None => break,
                    },
                    _ = signal.recv() => break,
                }
            }
            tracing::debug!("Config watch loop stopped");
        }))
    }

    pub fn evaluate(&self, request: &RequestDescriptor) -> Decision {
        self.limiter.evaluate(request)
    }

    pub fn log_event(&self, event: NewSecurityEvent) -> AuditResult<u64> {
        self.recorder.log(event)
    }

    pub fn encrypt(
        &self,
        table_id: &str,
        field_id: &str,
        row_id: &str,
        plaintext: &[u8],
    ) -> VaultResult<EncryptedFieldRecord> {
        self.vault.encrypt(table_id, field_id, row_id, plaintext)
    }

    /// Decrypt a cell. Authentication failures are also written to the audit log.
    pub fn decrypt(&self, table_id: &str, field_id: &str, row_id: &str) -> VaultResult<Vec<u8>> {
        self.vault
            .decrypt(table_id, field_id, row_id)
            .inspect_err(|e| {
                if let VaultError::DecryptionFailure { address } = e {
                    self.audit_decryption_failure(address);
                }
            })
    }

    /// Rotate to a new key and audit the rotation.
    pub fn rotate_key(&self, key: KeyMaterial) -> u32 {
        let version = self.vault.rotate_key(key);
        let event = NewSecurityEvent::new(event_types::KEY_ROTATED, Severity::Medium).detail("key_version", version);
        // Failures are escalated by the recorder itself.
        let _ = self.recorder.log(event);
        version
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.aggregator.snapshot()
    }

    fn audit_decryption_failure(&self, address: &CellAddress) {
        let event = NewSecurityEvent::new(event_types::DECRYPTION_FAILURE, Severity::High)
            .detail("table", &address.table_id)
            .detail("field", &address.field_id)
            .detail("row", &address.row_id);
        let _ = self.recorder.log(event);
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn recorder(&self) -> &Arc<EventRecorder> {
        &self.recorder
    }

    pub fn violations(&self) -> &Arc<ViolationTracker> {
        &self.violations
    }

    pub fn vault(&self) -> &Arc<EncryptionVault> {
        &self.vault
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.aggregator
    }

    pub fn pending_requests(&self) -> &Arc<PendingRequestCounter> {
        &self.pending
    }
}

fn apply_rate_limit_config(limiter: &RateLimiter, config: &SecurityConfig) -> Result<(), RuleConfigError> {
    limiter.replace_rules(config.rate_limit.rules.clone())?;
    if limiter.is_enabled() != config.rate_limit.enabled {
        limiter.set_enabled(config.rate_limit.enabled);
    }
    Ok(())
}
