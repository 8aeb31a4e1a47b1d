//! Injectable time source shared by the whole engine.
//!
//! Every expiry comparison in the broker (`locked_until`, session idle
//! timeouts) reads from a [`Clock`] rather than calling `Utc::now()`
//! directly. Production code uses [`SystemClock`]; deterministic tests use
//! [`VirtualClock`] and fast-forward it past lock expiries instead of
//! sleeping.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use std::sync::Mutex;

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;

/// Shared handle to the engine's time source.
pub type SharedClock = Arc<dyn Clock>;

/// A source of wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time according to this clock.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system.
#[derive(Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a shared system clock.
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually controlled clock for deterministic tests.
///
/// Starts at a fixed instant and only moves when told to. Sharing the same
/// `Arc<VirtualClock>` between the engine and a test lets the test make lock
/// expiry happen without waiting.
#[derive(Debug)]
pub struct VirtualClock {
    now: Mutex<DateTime<Utc>>,
}

impl VirtualClock {
    /// Create a virtual clock at the given start time.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a shared virtual clock at an arbitrary fixed epoch.
    pub fn shared() -> Arc<Self> {
        // Fixed start so test failures reproduce with identical timestamps.
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("fixed epoch is a valid UTC instant");
        Arc::new(Self::starting_at(start))
    }

    /// Move the clock forward.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now += delta;
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now = instant;
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}
