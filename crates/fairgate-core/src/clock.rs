//! Time sources for window bookkeeping.
//!
//! All window arithmetic is done on monotonic nanoseconds. The default
//! [`MonotonicClock`] reads `Instant` relative to its construction point;
//! [`ManualClock`] is driven explicitly and is what the tests use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Nanoseconds per millisecond.
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Monotonic nanosecond time source.
pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary, fixed origin. Never decreases.
    fn now_nanos(&self) -> u64;

    /// Milliseconds since the same origin.
    fn now_millis(&self) -> u64 {
        self.now_nanos() / NANOS_PER_MILLI
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by `std::time::Instant`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Clock advanced by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start_nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(start_nanos),
        }
    }

    pub fn set_nanos(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Release);
    }

    pub fn advance_nanos(&self, delta: u64) {
        self.nanos.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn advance_millis(&self, delta: u64) {
        self.advance_nanos(delta.saturating_mul(NANOS_PER_MILLI));
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}
