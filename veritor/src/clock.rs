//! Clock abstraction.
//!
//! Domain code never reads the wall clock directly; it asks a [`Clock`].
//! Production wires [`SystemClock`], tests wire [`FixedClock`] so timestamps
//! (and every identifier derived from one) are reproducible. Hash inputs for
//! plans, domains and state never include clock output.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Source of wall-clock time for the fabric.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// RFC 3339 timestamp string, the form stored on all public models.
    fn timestamp(&self) -> String {
        self.now().to_rfc3339()
    }

    /// Integer nanoseconds since the epoch, used by the wire envelope.
    fn timestamp_nanos(&self) -> i64 {
        self.now().timestamp_nanos_opt().unwrap_or(0)
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by the operating system.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests; advances only when told to.
#[derive(Debug)]
pub struct FixedClock {
    instant: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self {
            instant: Mutex::new(instant),
        }
    }

    /// Fixed clock at a stable reference instant.
    pub fn default_epoch() -> Self {
        Self::new(
            DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .expect("valid reference instant")
                .with_timezone(&Utc),
        )
    }

    pub fn advance(&self, delta: Duration) {
        let mut instant = self.instant.lock().expect("clock lock poisoned");
        *instant += delta;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.instant.lock().expect("clock lock poisoned") = instant;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.instant.lock().expect("clock lock poisoned")
    }
}

/// Convenience constructor for the common production wiring.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Convenience constructor for deterministic test wiring.
pub fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::default_epoch())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_is_stable_until_advanced() {
        let clock = FixedClock::default_epoch();
        let first = clock.timestamp();
        let second = clock.timestamp();
        assert_eq!(first, second);

        clock.advance(Duration::seconds(5));
        assert_ne!(clock.timestamp(), first);
    }

    #[test]
    fn nanos_are_monotonic_with_advance() {
        let clock = FixedClock::default_epoch();
        let before = clock.timestamp_nanos();
        clock.advance(Duration::milliseconds(1));
        assert!(clock.timestamp_nanos() > before);
    }
}
