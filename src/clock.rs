//! Wall-clock abstraction.
//!
//! Window truncation, block expiry and rollup ranges all read time through
//! [`Clock`] so that tests can drive time explicitly with [`MockClock`].

use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

/// Source of the current UTC time.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// System clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Controllable clock for tests.
///
/// All clones share the same underlying time value, so advancing one clone
/// advances every component that holds it.
///
/// ```
/// use security_substrate::clock::{Clock, MockClock};
/// use chrono::{Duration, TimeZone, Utc};
///
/// let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
/// let clock = MockClock::new(start);
/// clock.advance(Duration::seconds(90));
/// assert_eq!(clock.now(), start + Duration::seconds(90));
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, by: Duration) {
        let mut time = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *time += by;
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, at: DateTime<Utc>) {
        let mut time = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *time = at;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle used by every component.
pub type SharedClock = Arc<dyn Clock>;
