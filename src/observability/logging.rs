//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Honour `RUST_LOG` over the configured level
//!
//! # Design Decisions
//! - JSON output for production, human-readable output for development
//! - Logs go to stderr; stdout is left to command output
//! - Initialization is fallible rather than panicking when called twice

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Install the global subscriber.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.log_level)));

    let json = config.json_logs.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let pretty = (!config.json_logs).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .try_init()
}

fn default_directive(level: &str) -> String {
    format!("security_substrate={},security_cli={},warn", level, level)
}
