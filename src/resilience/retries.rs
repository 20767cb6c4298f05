//! Retry execution for persistence calls.
//!
//! # Design Decisions
//! - Blocking: callers of the audit log need the outcome before returning
//! - Every failed attempt is logged; exhaustion returns the last error
//!   together with the attempt count so the caller can escalate

use std::fmt::Display;

use crate::resilience::backoff::RetryPolicy;

/// All attempts failed.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `op` until it succeeds or the policy's attempts are used up.
pub fn retry_blocking<T, E, F>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, RetryExhausted<E>>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(operation, attempt, delay = ?delay, error = %e, "Operation failed, retrying");
                std::thread::sleep(delay);
            }
            Err(e) => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: e,
                })
            }
        }
    }
}
