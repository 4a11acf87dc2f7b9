//! Time source for claim bookkeeping
//!
//! The in-memory store stamps every claim with [`Clock::now`] and derives
//! idle times from it. Tests and the DST harness drive a [`SimulatedClock`]
//! by hand so idle thresholds are hit exactly; [`ProductionClock`] follows
//! the wall clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Unix milliseconds, the same unit stream entry ids carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time from `earlier` to `self`; zero when `earlier` is later
    pub fn saturating_sub(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

pub trait Clock: Send + Sync + Clone + 'static {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time, sampled once at construction and advanced monotonically
#[derive(Debug, Clone)]
pub struct ProductionClock {
    origin: Instant,
    origin_ms: u64,
}

impl Default for ProductionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductionClock {
    pub fn new() -> Self {
        // Before the epoch only shifts the ids; ordering still holds.
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        ProductionClock {
            origin: Instant::now(),
            origin_ms,
        }
    }
}

impl Clock for ProductionClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.origin_ms + self.origin.elapsed().as_millis() as u64)
    }
}

/// Hand-driven time; clones share one counter
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    now_ms: Arc<AtomicU64>,
}

impl SimulatedClock {
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.advance_ms(by.as_millis() as u64);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to `ms`, backwards included
    #[cfg(test)]
    pub(crate) fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now_ms.load(Ordering::SeqCst))
    }
}
