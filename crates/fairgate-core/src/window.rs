//! Tumbling measurement windows.
//!
//! A [`TumblingWindow`] owns the current [`WindowState`] epoch. Every sample
//! lands in the epoch that is current when the sample is taken; when the
//! [`RolloverStrategy`] says the epoch is over, exactly one caller swaps in a
//! fresh state and runs the rollover callback against the retired one.
//!
//! Epoch lifecycle: Open -> Swapping (single-use latch won) -> Retired
//! (callback ran, histogram cleared).

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::clock::NANOS_PER_MILLI;
use crate::config::AdmissionConfig;
use crate::error::{AdmissionError, Result};
use crate::priority::Priority;

/// Rollover thresholds for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub time_cycle_nanos: u64,
    pub request_cycle: u64,
}

impl WindowConfig {
    pub fn new(time_cycle_nanos: u64, request_cycle: u64) -> Result<Self> {
        if time_cycle_nanos == 0 {
            return Err(AdmissionError::config("window time cycle must be positive"));
        }
        if request_cycle == 0 {
            return Err(AdmissionError::config("window request cycle must be positive"));
        }
        Ok(Self {
            time_cycle_nanos,
            request_cycle,
        })
    }

    pub fn from_admission(config: &AdmissionConfig) -> Result<Self> {
        Self::new(config.time_cycle_nanos(), config.window_request_cycle)
    }
}

impl fmt::Display for WindowConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WindowConfig(time={}ms,count={})",
            self.time_cycle_nanos / NANOS_PER_MILLI,
            self.request_cycle
        )
    }
}

/// Accumulator for one measurement epoch.
///
/// Counters are add-only and safe under any number of concurrent writers.
pub struct WindowState {
    start_nanos: u64,
    requested: AtomicU64,
    admitted: AtomicU64,
    queued_nanos: AtomicU64,
    histogram: DashMap<u16, AtomicU64>,
    rollover_latch: AtomicBool,
}

impl WindowState {
    pub fn new(start_nanos: u64) -> Self {
        Self {
            start_nanos,
            requested: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            queued_nanos: AtomicU64::new(0),
            histogram: DashMap::new(),
            rollover_latch: AtomicBool::new(false),
        }
    }

    /// Records one workload.
    pub fn sample(&self, priority: Priority, admitted: bool) {
        let p = priority.p();
        match self.histogram.get(&p) {
            Some(bucket) => {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.histogram
                    .entry(p)
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        if admitted {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        }
        self.requested.fetch_add(1, Ordering::AcqRel);
    }

    /// Adds reported queueing delay.
    pub fn add_queued_nanos(&self, nanos: u64) {
        if nanos > 0 {
            self.queued_nanos.fetch_add(nanos, Ordering::Relaxed);
        }
    }

    pub fn start_nanos(&self) -> u64 {
        self.start_nanos
    }

    pub fn elapsed_nanos(&self, now_nanos: u64) -> u64 {
        now_nanos.saturating_sub(self.start_nanos)
    }

    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn shedded(&self) -> u64 {
        self.requested().saturating_sub(self.admitted())
    }

    pub fn queued_nanos(&self) -> u64 {
        self.queued_nanos.load(Ordering::Relaxed)
    }

    /// Mean queueing delay per request in milliseconds; zero for an empty window.
    pub fn avg_queued_ms(&self) -> f64 {
        let requested = self.requested();
        if requested == 0 {
            return 0.0;
        }
        self.queued_nanos() as f64 / requested as f64 / NANOS_PER_MILLI as f64
    }

    /// Ordered copy of the per-priority request counts.
    pub fn histogram(&self) -> Histogram {
        let buckets = self
            .histogram
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();
        Histogram { buckets }
    }

    /// Number of distinct priorities seen.
    pub fn distinct_priorities(&self) -> usize {
        self.histogram.len()
    }

    /// Claims the right to retire this state. Succeeds once per instance.
    fn try_acquire_latch(&self) -> bool {
        self.rollover_latch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cleanup(&self) {
        self.histogram.clear();
    }
}

impl fmt::Debug for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowState")
            .field("start_nanos", &self.start_nanos)
            .field("requested", &self.requested())
            .field("admitted", &self.admitted())
            .field("queued_nanos", &self.queued_nanos())
            .field("distinct_priorities", &self.histogram.len())
            .finish()
    }
}

/// Immutable, ordered request histogram keyed by `P`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histogram {
    buckets: BTreeMap<u16, u64>,
}

impl Histogram {
    pub fn from_counts<I>(counts: I) -> Self
    where
        I: IntoIterator<Item = (u16, u64)>,
    {
        let mut buckets = BTreeMap::new();
        for (p, count) in counts {
            if count > 0 {
                *buckets.entry(p).or_insert(0) += count;
            }
        }
        Self { buckets }
    }

    /// Buckets with key `<= p`, highest key first.
    pub fn descending_from(&self, p: u16) -> impl Iterator<Item = (u16, u64)> + '_ {
        self.buckets.range(..=p).rev().map(|(k, v)| (*k, *v))
    }

    /// Buckets with key `> p`, lowest key first.
    pub fn ascending_after(&self, p: u16) -> impl Iterator<Item = (u16, u64)> + '_ {
        self.buckets
            .range((Bound::Excluded(p), Bound::Unbounded))
            .map(|(k, v)| (*k, *v))
    }

    pub fn get(&self, p: u16) -> u64 {
        self.buckets.get(&p).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.buckets.values().sum()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Decides when an epoch ends and builds the next one.
pub trait RolloverStrategy: Send + Sync {
    fn should_rollover(&self, state: &WindowState, now_nanos: u64, config: &WindowConfig) -> bool;

    fn new_state(&self, now_nanos: u64) -> WindowState {
        WindowState::new(now_nanos)
    }
}

/// Rolls over on whichever of the count or time cycle is reached first.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountAndTimeRollover;

impl RolloverStrategy for CountAndTimeRollover {
    fn should_rollover(&self, state: &WindowState, now_nanos: u64, config: &WindowConfig) -> bool {
        state.requested() >= config.request_cycle
            || state.elapsed_nanos(now_nanos) >= config.time_cycle_nanos
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CountRollover;

impl RolloverStrategy for CountRollover {
    fn should_rollover(&self, state: &WindowState, _now_nanos: u64, config: &WindowConfig) -> bool {
        state.requested() >= config.request_cycle
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRollover;

impl RolloverStrategy for TimeRollover {
    fn should_rollover(&self, state: &WindowState, now_nanos: u64, config: &WindowConfig) -> bool {
        state.elapsed_nanos(now_nanos) >= config.time_cycle_nanos
    }
}

/// Non-overlapping measurement window with an atomically replaced state.
pub struct TumblingWindow {
    name: String,
    config: WindowConfig,
    strategy: Box<dyn RolloverStrategy>,
    current: RwLock<Arc<WindowState>>,
    rollovers: AtomicU64,
    failed_callbacks: AtomicU64,
}

impl TumblingWindow {
    pub fn new(name: impl Into<String>, config: WindowConfig, start_nanos: u64) -> Self {
        Self::with_strategy(name, config, Box::new(CountAndTimeRollover), start_nanos)
    }

    pub fn with_strategy(
        name: impl Into<String>,
        config: WindowConfig,
        strategy: Box<dyn RolloverStrategy>,
        start_nanos: u64,
    ) -> Self {
        let name = name.into();
        let initial = Arc::new(strategy.new_state(start_nanos));
        info!(name = %name, config = %config, "tumbling window created");
        Self {
            name,
            config,
            strategy,
            current: RwLock::new(initial),
            rollovers: AtomicU64::new(0),
            failed_callbacks: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// The open epoch.
    pub fn current(&self) -> Arc<WindowState> {
        Arc::clone(&*self.current.read())
    }

    pub fn rollovers(&self) -> u64 {
        self.rollovers.load(Ordering::Relaxed)
    }

    pub fn failed_callbacks(&self) -> u64 {
        self.failed_callbacks.load(Ordering::Relaxed)
    }

    /// Adds queueing delay to the open epoch.
    pub fn add_queued_nanos(&self, nanos: u64) {
        self.current.read().add_queued_nanos(nanos);
    }

    /// Samples a workload and retires the epoch if it is over.
    ///
    /// `on_rollover` receives the swap time and the retired, frozen state. It
    /// runs after the next epoch is already published; a panic inside it is
    /// caught and counted, never propagated.
    ///
    /// Sampling holds a read guard on the current epoch. The swap takes the
    /// write guard only to replace the pointer, so concurrent callers block
    /// for that publish and nothing else; the callback runs outside it.
    pub fn advance<F>(&self, priority: Priority, admitted: bool, now_nanos: u64, on_rollover: F)
    where
        F: FnOnce(u64, &WindowState),
    {
        let state = {
            let guard = self.current.read();
            guard.sample(priority, admitted);
            if !self
                .strategy
                .should_rollover(&guard, now_nanos, &self.config)
            {
                return;
            }
            Arc::clone(&*guard)
        };
        self.try_rollover(now_nanos, state, on_rollover);
    }

    fn try_rollover<F>(&self, now_nanos: u64, retiring: Arc<WindowState>, on_rollover: F)
    where
        F: FnOnce(u64, &WindowState),
    {
        if !retiring.try_acquire_latch() {
            return;
        }

        let next = Arc::new(self.strategy.new_state(now_nanos));
        {
            let mut current = self.current.write();
            if !Arc::ptr_eq(&*current, &retiring) {
                return;
            }
            *current = next;
        }
        self.rollovers.fetch_add(1, Ordering::Relaxed);

        debug!(
            name = %self.name,
            elapsed_ms = retiring.elapsed_nanos(now_nanos) / NANOS_PER_MILLI,
            admitted = retiring.admitted(),
            requested = retiring.requested(),
            overshoot = retiring.requested() as i64 - self.config.request_cycle as i64,
            "window rolled over"
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| on_rollover(now_nanos, &retiring)));
        if outcome.is_err() {
            self.failed_callbacks.fetch_add(1, Ordering::Relaxed);
            warn!(name = %self.name, "rollover callback panicked, watermark left unchanged");
        }
        retiring.cleanup();
    }
}

impl fmt::Debug for TumblingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TumblingWindow")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("rollovers", &self.rollovers())
            .finish()
    }
}
