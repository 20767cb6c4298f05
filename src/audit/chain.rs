//! Hash chaining for tamper evidence.
//!
//! `hash = hex(SHA-256(canonical JSON of every field except `hash`))`, where
//! the hashed body includes `prev_hash`. The first event links to
//! [`GENESIS_HASH`]. Editing, removing or reordering any event breaks every
//! hash after it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::audit::types::{AuditError, AuditResult, SecurityEvent, Severity};

/// `prev_hash` of the first event in a log.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Serialize)]
struct HashedBody<'a> {
    id: &'a Uuid,
    sequence: u64,
    event_type: &'a str,
    user_id: Option<&'a str>,
    ip: &'a str,
    user_agent: &'a str,
    timestamp: &'a DateTime<Utc>,
    severity: Severity,
    details: &'a BTreeMap<String, String>,
    prev_hash: &'a str,
}

/// Compute the chain hash of an event.
pub fn compute_hash(event: &SecurityEvent) -> AuditResult<String> {
    let body = HashedBody {
        id: &event.id,
        sequence: event.sequence,
        event_type: &event.event_type,
        user_id: event.user_id.as_deref(),
        ip: &event.ip,
        user_agent: &event.user_agent,
        timestamp: &event.timestamp,
        severity: event.severity,
        details: &event.details,
        prev_hash: &event.prev_hash,
    };
    let bytes = serde_json::to_vec(&body)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Verify sequence continuity, links and hashes of an ordered run of events.
///
/// `events` must start at sequence 1 (a full log).
pub fn verify_chain<'a, I>(events: I) -> AuditResult<()>
where
    I: IntoIterator<Item = &'a SecurityEvent>,
{
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut expected_seq = 1u64;

    for event in events {
        if event.sequence != expected_seq {
            return Err(AuditError::ChainBroken {
                sequence: event.sequence,
                reason: "sequence gap",
            });
        }
        if event.prev_hash != expected_prev {
            return Err(AuditError::ChainBroken {
                sequence: event.sequence,
                reason: "previous hash mismatch",
            });
        }
        if compute_hash(event)? != event.hash {
            return Err(AuditError::ChainBroken {
                sequence: event.sequence,
                reason: "hash mismatch",
            });
        }
        expected_prev = event.hash.clone();
        expected_seq += 1;
    }
    Ok(())
}
