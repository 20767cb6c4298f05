use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;

use security_substrate::audit::{verify_chain, EventRecorder, InMemoryEventStore, InlineSink, SecurityEvent};
use security_substrate::clock::SystemClock;
use security_substrate::config::{load_config, ObservabilityConfig};
use security_substrate::observability::logging::init_logging;
use security_substrate::ratelimit::{InMemoryCounterStore, RateLimiter, RequestDescriptor, RuleSet};
use security_substrate::resilience::RetryPolicy;
use security_substrate::storage::read_all;
use security_substrate::vault::{KeyMaterial, KeyRing};
use security_substrate::violations::ViolationTracker;

#[derive(Parser)]
#[command(name = "security-cli")]
#[command(about = "Operator tooling for the security substrate", long_about = None)]
struct Cli {
    /// Log level for diagnostics on stderr
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    CheckConfig {
        path: PathBuf,
    },
    /// Verify the hash chain of a JSON-lines audit log
    VerifyAudit {
        path: PathBuf,
    },
    /// Generate a base64 AES-256 key for the vault
    GenKey,
    /// Dry-run requests against a configuration's rate limit rules
    Evaluate {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long)]
        endpoint: String,

        #[arg(short, long, default_value = "GET")]
        method: String,

        #[arg(short, long)]
        user: Option<String>,

        #[arg(short, long)]
        ip: Option<String>,

        /// Number of identical requests to send
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&ObservabilityConfig {
        log_level: cli.log_level.clone(),
        json_logs: false,
    })?;

    match cli.command {
        Commands::CheckConfig { path } => {
            let config = load_config(&path)?;
            let keys = KeyRing::from_config(&config.vault)?;
            print_json(&json!({
                "status": "ok",
                "rules": config.rate_limit.rules.iter().map(|r| &r.name).collect::<Vec<_>>(),
                "rate_limit_enabled": config.rate_limit.enabled,
                "key_versions": keys.versions(),
                "active_key_version": keys.active_version(),
                "audit_log": config.audit.log_path,
            }))?;
        }
        Commands::VerifyAudit { path } => {
            let events: Vec<SecurityEvent> = read_all(&path)?;
            verify_chain(&events)?;
            print_json(&json!({
                "status": "ok",
                "events": events.len(),
                "head_hash": events.last().map(|e| e.hash.as_str()),
            }))?;
        }
        Commands::GenKey => {
            println!("{}", KeyMaterial::generate().to_base64().as_str());
        }
        Commands::Evaluate {
            config,
            endpoint,
            method,
            user,
            ip,
            count,
        } => {
            let config = load_config(&config)?;
            let clock = Arc::new(SystemClock::new());
            let recorder = Arc::new(EventRecorder::open(
                Arc::new(InMemoryEventStore::new()),
                clock.clone(),
                RetryPolicy::no_retry(),
            )?);
            let violations = Arc::new(ViolationTracker::in_memory());
            let limiter = RateLimiter::new(
                RuleSet::compile(config.rate_limit.rules)?,
                Arc::new(InMemoryCounterStore::new()),
                Arc::new(InlineSink::new(recorder.clone(), violations.clone())),
                clock,
            );
            limiter.set_enabled(config.rate_limit.enabled);

            let request = RequestDescriptor {
                endpoint,
                method,
                user_id: user,
                ip,
                user_agent: Some("security-cli".to_string()),
            };
            for n in 1..=count {
                let decision = limiter.evaluate(&request);
                print_json(&json!({ "request": n, "decision": decision }))?;
            }
            eprintln!(
                "{} audit events, {} violations recorded",
                recorder.len(),
                violations.len()
            );
        }
    }

    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
