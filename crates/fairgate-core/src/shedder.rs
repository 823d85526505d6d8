//! Priority watermark controller.
//!
//! A [`FairShedder`] admits a workload when its `P` is at or below the
//! current watermark. Every workload, admitted or not, is sampled into a
//! tumbling window; each time the window rolls over the watermark is moved
//! using the retired histogram and the gradient of the shedder's
//! [`GradientSource`].
//!
//! Shedding is multiplicative and fast (a share of last window's admitted
//! work), recovery is slow (a smaller share, walked one bucket at a time),
//! except that an idle window resets straight to admit-all.

use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::clock::SharedClock;
use crate::config::AdmissionConfig;
use crate::error::{AdmissionError, Result};
use crate::gradient::{
    is_overloaded, CpuGradient, CpuSampler, GradientBounds, GradientSource, QueueGradient,
};
use crate::priority::Priority;
use crate::window::{Histogram, TumblingWindow, WindowConfig, WindowState};

/// Fixed adaptation constants of one shedder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShedderTuning {
    /// Share of last window's admitted work to shed when overloaded.
    pub drop_rate: f64,
    /// Share of last window's admitted work to re-admit when healthy.
    pub recover_rate: f64,
    /// Largest relative over-shed accepted when shedding the crossing bucket.
    pub over_shed_bound: f64,
    /// Clamp range of the gradient source.
    pub bounds: GradientBounds,
}

impl ShedderTuning {
    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self {
            drop_rate: config.drop_rate,
            recover_rate: config.recover_rate,
            over_shed_bound: config.over_shed_bound,
            bounds: config.gradient_bounds(),
        }
    }
}

impl Default for ShedderTuning {
    fn default() -> Self {
        Self::from_config(&AdmissionConfig::default())
    }
}

/// Why a prediction left the watermark where it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Hold {
    /// Too little admitted work to yield a non-zero drop target.
    NoDropTarget,
    /// No demand at or above the watermark's priority remains to shed.
    NothingToShed,
    /// Already admitting everything.
    AlreadyLowest,
    /// Another prediction moved the watermark first.
    Superseded,
}

/// Outcome of one watermark prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjustment {
    Unchanged(Hold),
    /// Watermark moved towards higher priority. `planned` is how much of last
    /// window's demand the new watermark would have rejected.
    Shed {
        from: Priority,
        to: Priority,
        planned: u64,
        target: u64,
        steps: usize,
    },
    /// Watermark moved towards lower priority.
    Recover {
        from: Priority,
        to: Priority,
        planned: u64,
        target: u64,
        steps: usize,
    },
}

impl Adjustment {
    /// The watermark after this adjustment, given the one before it.
    pub fn watermark(&self, before: Priority) -> Priority {
        match self {
            Adjustment::Unchanged(_) => before,
            Adjustment::Shed { to, .. } | Adjustment::Recover { to, .. } => *to,
        }
    }
}

/// Moves the watermark towards higher priority to drop roughly
/// `drop_rate * admitted` of last window's demand.
///
/// Buckets are walked from the watermark's own `P` downwards. When the
/// bucket that reaches the target is found, it is shed too (watermark moves
/// to the next lower bucket) if the resulting over-shed error is within
/// `over_shed_bound`, or if keeping it would shed nothing at all; otherwise
/// the watermark stops on it. The highest-priority bucket is never shed.
pub fn shed_more(
    current: Priority,
    histogram: &Histogram,
    admitted: u64,
    tuning: &ShedderTuning,
) -> Adjustment {
    let target = (tuning.drop_rate * admitted as f64) as u64;
    if target == 0 {
        return Adjustment::Unchanged(Hold::NoDropTarget);
    }

    let mut buckets = histogram.descending_from(current.p()).peekable();
    let mut accumulated = 0u64;
    let mut steps = 0usize;

    while let Some((p, count)) = buckets.next() {
        accumulated += count;
        steps += 1;

        let (to_p, planned) = if accumulated >= target {
            let error = (accumulated - target) as f64 / target as f64;
            let keeping_sheds_nothing = steps == 1;
            match buckets.peek() {
                Some(&(next_p, _)) if error <= tuning.over_shed_bound || keeping_sheds_nothing => {
                    (next_p, accumulated)
                }
                _ => (p, accumulated - count),
            }
        } else if buckets.peek().is_none() {
            // ran out of buckets: best effort
            (p, accumulated - count)
        } else {
            continue;
        };

        let to = Priority::derive_from(to_p);
        if to == current {
            return Adjustment::Unchanged(Hold::NothingToShed);
        }
        return Adjustment::Shed {
            from: current,
            to,
            planned,
            target,
            steps,
        };
    }

    Adjustment::Unchanged(Hold::NothingToShed)
}

/// Moves the watermark towards lower priority to re-admit roughly
/// `recover_rate * admitted` of last window's demand.
pub fn admit_more(
    current: Priority,
    histogram: &Histogram,
    admitted: u64,
    tuning: &ShedderTuning,
) -> Adjustment {
    if current.is_lowest() {
        return Adjustment::Unchanged(Hold::AlreadyLowest);
    }

    let lowest = Priority::lowest();
    let target = (tuning.recover_rate * admitted as f64) as u64;
    if target == 0 {
        // idle window: nothing justifies holding the bar
        return Adjustment::Recover {
            from: current,
            to: lowest,
            planned: 0,
            target,
            steps: 0,
        };
    }

    let mut accumulated = 0u64;
    let mut steps = 0usize;
    for (p, count) in histogram.ascending_after(current.p()) {
        accumulated += count;
        steps += 1;
        if accumulated >= target {
            return Adjustment::Recover {
                from: current,
                to: Priority::derive_from(p),
                planned: accumulated,
                target,
                steps,
            };
        }
    }

    Adjustment::Recover {
        from: current,
        to: lowest,
        planned: accumulated,
        target,
        steps,
    }
}

/// Snapshot of a shedder's state.
#[derive(Debug, Clone, Serialize)]
pub struct ShedderStats {
    /// Shedder name, the workload kind for queue shedders.
    pub name: String,
    /// Gradient source, `"cpu"` or `"queue"`.
    pub source: &'static str,
    /// Current watermark.
    pub watermark: Priority,
    /// Windows retired so far.
    pub rollovers: u64,
    /// Predictions that raised the bar.
    pub sheds: u64,
    /// Predictions that lowered the bar.
    pub recovers: u64,
    /// Predictions that left the watermark unchanged.
    pub holds: u64,
    /// Rollover callbacks that panicked.
    pub failed_callbacks: u64,
    /// Gradient of the most recent prediction, if any.
    pub last_gradient: Option<f64>,
}

#[derive(Debug, Default)]
struct ShedderCounters {
    sheds: AtomicU64,
    recovers: AtomicU64,
    holds: AtomicU64,
    last_gradient_bits: AtomicU64,
    predictions: AtomicU64,
}

/// Watermark-based shedder over one gradient source.
pub struct FairShedder {
    name: String,
    tuning: ShedderTuning,
    source: GradientSource,
    window: TumblingWindow,
    watermark: AtomicU16,
    clock: SharedClock,
    counters: ShedderCounters,
}

impl FairShedder {
    /// Shedder over an arbitrary gradient source. Fails if `config` does not
    /// validate.
    pub fn new(
        name: impl Into<String>,
        source: GradientSource,
        config: &AdmissionConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        let window = TumblingWindow::new(
            name.clone(),
            WindowConfig::from_admission(config)?,
            clock.now_nanos(),
        );
        info!(
            name = %name,
            source = source.kind(),
            drop_rate = config.drop_rate,
            recover_rate = config.recover_rate,
            "shedder created"
        );
        Ok(Self {
            name,
            tuning: ShedderTuning::from_config(config),
            source,
            window,
            watermark: AtomicU16::new(Priority::lowest().p()),
            clock,
            counters: ShedderCounters::default(),
        })
    }

    /// Shedder driven by process CPU utilisation.
    pub fn cpu(
        name: impl Into<String>,
        sampler: Arc<dyn CpuSampler>,
        config: &AdmissionConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        let source = GradientSource::Cpu(CpuGradient::new(
            sampler,
            config.cpu_usage_upper_bound,
            config.cpu_ema_alpha,
        )?);
        Self::new(name, source, config, clock)
    }

    /// Shedder driven by reported queueing delay and explicit overload.
    pub fn queue(
        name: impl Into<String>,
        config: &AdmissionConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        let source = GradientSource::Queue(QueueGradient::new(
            config.avg_queue_ms_upper_bound,
            config.time_cycle_nanos(),
        )?);
        Self::new(name, source, config, clock)
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Least important priority currently admitted.
    pub fn watermark(&self) -> Priority {
        Priority::derive_from(self.watermark.load(Ordering::Acquire))
    }

    /// Measurement window feeding the predictions.
    pub fn window(&self) -> &TumblingWindow {
        &self.window
    }

    /// Adaptation constants taken from the config.
    pub fn tuning(&self) -> &ShedderTuning {
        &self.tuning
    }

    /// Admits `priority` if it is within the watermark. The sample is recorded
    /// either way so the next prediction sees true demand.
    pub fn admit(&self, priority: Priority) -> bool {
        let admitted = priority.p() <= self.watermark.load(Ordering::Acquire);
        let now = self.clock.now_nanos();
        self.window
            .advance(priority, admitted, now, |at, retired| self.on_rollover(at, retired));
        admitted
    }

    /// Adds queueing delay reported for this shedder's resource.
    pub fn add_queued_nanos(&self, nanos: u64) {
        self.window.add_queued_nanos(nanos);
    }

    /// Forces a busy gradient for one window time cycle from `at_nanos`.
    pub fn mark_overloaded(&self, at_nanos: u64) -> Result<()> {
        match self.source.as_queue() {
            Some(queue) => {
                debug!(name = %self.name, at_nanos, "explicit overload feedback");
                queue.mark_overloaded(at_nanos);
                Ok(())
            }
            None => Err(AdmissionError::config(format!(
                "shedder {} has no queue gradient to mark overloaded",
                self.name
            ))),
        }
    }

    /// Gradient for a retired window.
    pub fn overload_gradient(&self, now_nanos: u64, snapshot: &WindowState) -> f64 {
        self.source
            .overload_gradient(now_nanos, snapshot, &self.tuning.bounds)
    }

    fn on_rollover(&self, now_nanos: u64, retired: &WindowState) {
        let gradient = self.overload_gradient(now_nanos, retired);
        self.predict_watermark(retired, gradient);
    }

    /// Computes and publishes the next watermark from the window that just
    /// closed.
    pub fn predict_watermark(&self, last_window: &WindowState, gradient: f64) -> Adjustment {
        let histogram = last_window.histogram();
        self.predict_from_histogram(&histogram, last_window.admitted(), gradient)
    }

    /// As [`FairShedder::predict_watermark`], over an already-frozen histogram.
    pub fn predict_from_histogram(
        &self,
        histogram: &Histogram,
        admitted: u64,
        gradient: f64,
    ) -> Adjustment {
        self.counters
            .last_gradient_bits
            .store(gradient.to_bits(), Ordering::Relaxed);
        self.counters.predictions.fetch_add(1, Ordering::Relaxed);
        let current_p = self.watermark.load(Ordering::Acquire);
        let current = Priority::derive_from(current_p);
        trace!(
            name = %self.name,
            admitted,
            requested = histogram.total(),
            gradient,
            watermark = %current,
            "predicting watermark"
        );

        let adjustment = if is_overloaded(gradient) {
            shed_more(current, histogram, admitted, &self.tuning)
        } else {
            admit_more(current, histogram, admitted, &self.tuning)
        };

        self.publish(current, adjustment, histogram.total(), gradient)
    }

    /// Publishes `adjustment` if the watermark still equals `from`, the value
    /// it was computed against.
    fn publish(
        &self,
        from: Priority,
        adjustment: Adjustment,
        requested: u64,
        gradient: f64,
    ) -> Adjustment {
        let next = adjustment.watermark(from);
        if next != from
            && self
                .watermark
                .compare_exchange(from.p(), next.p(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            self.counters.holds.fetch_add(1, Ordering::Relaxed);
            debug!(name = %self.name, "watermark moved concurrently, prediction dropped");
            return Adjustment::Unchanged(Hold::Superseded);
        }

        self.log_adjustment(&adjustment, requested, gradient);
        adjustment
    }

    fn log_adjustment(&self, adjustment: &Adjustment, requested: u64, gradient: f64) {
        match *adjustment {
            Adjustment::Unchanged(hold) => {
                self.counters.holds.fetch_add(1, Ordering::Relaxed);
                debug!(name = %self.name, ?hold, requested, gradient, "watermark held");
            }
            Adjustment::Shed {
                from,
                to,
                planned,
                target,
                steps,
            } => {
                self.counters.sheds.fetch_add(1, Ordering::Relaxed);
                warn!(
                    name = %self.name,
                    %from,
                    %to,
                    planned,
                    target,
                    steps,
                    requested,
                    gradient,
                    "raised admission bar"
                );
            }
            Adjustment::Recover {
                from,
                to,
                planned,
                target,
                steps,
            } => {
                self.counters.recovers.fetch_add(1, Ordering::Relaxed);
                if to.is_lowest() {
                    info!(name = %self.name, %from, planned, target, gradient, "admission bar reset");
                } else {
                    warn!(
                        name = %self.name,
                        %from,
                        %to,
                        planned,
                        target,
                        steps,
                        gradient,
                        "lowered admission bar"
                    );
                }
            }
        }
    }

    /// Point-in-time view of counters and the watermark.
    pub fn stats(&self) -> ShedderStats {
        let last_gradient = (self.counters.predictions.load(Ordering::Relaxed) > 0)
            .then(|| f64::from_bits(self.counters.last_gradient_bits.load(Ordering::Relaxed)));
        ShedderStats {
            name: self.name.clone(),
            source: self.source.kind(),
            watermark: self.watermark(),
            rollovers: self.window.rollovers(),
            sheds: self.counters.sheds.load(Ordering::Relaxed),
            recovers: self.counters.recovers.load(Ordering::Relaxed),
            holds: self.counters.holds.load(Ordering::Relaxed),
            failed_callbacks: self.window.failed_callbacks(),
            last_gradient,
        }
    }

    /// Restores admit-all. Accumulated window state is kept.
    pub fn reset_watermark(&self) {
        self.watermark
            .store(Priority::lowest().p(), Ordering::Release);
        info!(name = %self.name, "watermark reset");
    }
}

impl fmt::Debug for FairShedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FairShedder")
            .field("name", &self.name)
            .field("source", &self.source.kind())
            .field("watermark", &self.watermark())
            .field("window", &self.window)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::gradient::FixedCpuSampler;

    fn tuning() -> ShedderTuning {
        ShedderTuning::default()
    }

    fn at(p: u16) -> Priority {
        Priority::derive_from(p)
    }

    fn queue_shedder(request_cycle: u64) -> (FairShedder, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1));
        let config = AdmissionConfig {
            window_request_cycle: request_cycle,
            ..AdmissionConfig::default()
        };
        let shedder = FairShedder::queue("RPC", &config, clock.clone()).unwrap();
        (shedder, clock)
    }

    #[test]
    fn test_shed_single_bucket_stops_on_it() {
        let histogram = Histogram::from_counts([(10, 900)]);
        let adjustment = shed_more(Priority::lowest(), &histogram, 900, &tuning());
        assert_eq!(adjustment.watermark(Priority::lowest()), at(10));
        assert!(matches!(adjustment, Adjustment::Shed { target: 45, planned: 0, .. }));
    }

    #[test]
    fn test_shed_first_bucket_overshoot_moves_past_it() {
        let histogram = Histogram::from_counts([(5, 100), (10, 200)]);
        let adjustment = shed_more(Priority::lowest(), &histogram, 300, &tuning());
        assert_eq!(
            adjustment,
            Adjustment::Shed {
                from: Priority::lowest(),
                to: at(5),
                planned: 200,
                target: 15,
                steps: 1,
            }
        );
    }

    #[test]
    fn test_shed_keeps_crossing_bucket_when_error_too_large() {
        // target 10: 8 from P=30, then P=20 overshoots to 108 (error 9.8)
        let histogram = Histogram::from_counts([(10, 100), (20, 100), (30, 8)]);
        let adjustment = shed_more(at(40), &histogram, 200, &tuning());
        assert_eq!(
            adjustment,
            Adjustment::Shed {
                from: at(40),
                to: at(20),
                planned: 8,
                target: 10,
                steps: 2,
            }
        );
    }

    #[test]
    fn test_shed_takes_crossing_bucket_within_bound() {
        // target 10: 6 + 8 = 14, error 0.4
        let histogram = Histogram::from_counts([(10, 186), (20, 8), (30, 6)]);
        let adjustment = shed_more(at(30), &histogram, 200, &tuning());
        assert_eq!(adjustment.watermark(at(30)), at(10));
        assert!(matches!(adjustment, Adjustment::Shed { planned: 14, steps: 2, .. }));
    }

    #[test]
    fn test_shed_best_effort_when_demand_runs_out() {
        let histogram = Histogram::from_counts([(10, 3), (20, 3)]);
        let adjustment = shed_more(at(20), &histogram, 1000, &tuning());
        assert_eq!(adjustment.watermark(at(20)), at(10));
        assert!(matches!(adjustment, Adjustment::Shed { planned: 3, target: 50, .. }));
    }

    #[test]
    fn test_shed_ignores_buckets_above_watermark() {
        let histogram = Histogram::from_counts([(50, 1000), (60, 1000)]);
        let adjustment = shed_more(at(40), &histogram, 2000, &tuning());
        assert_eq!(adjustment, Adjustment::Unchanged(Hold::NothingToShed));
    }

    #[test]
    fn test_shed_holds_without_drop_target() {
        let histogram = Histogram::from_counts([(10, 10)]);
        let adjustment = shed_more(Priority::lowest(), &histogram, 10, &tuning());
        assert_eq!(adjustment, Adjustment::Unchanged(Hold::NoDropTarget));
    }

    #[test]
    fn test_shed_pinned_on_only_bucket() {
        let histogram = Histogram::from_counts([(10, 900)]);
        let adjustment = shed_more(at(10), &histogram, 900, &tuning());
        assert_eq!(adjustment, Adjustment::Unchanged(Hold::NothingToShed));
    }

    #[test]
    fn test_recover_idle_window_resets() {
        let histogram = Histogram::from_counts([(10, 5)]);
        let adjustment = admit_more(at(10), &histogram, 0, &tuning());
        assert_eq!(adjustment.watermark(at(10)), Priority::lowest());
    }

    #[test]
    fn test_recover_no_lower_priority_demand_resets() {
        let histogram = Histogram::from_counts([(5, 1000), (10, 1000)]);
        let adjustment = admit_more(at(10), &histogram, 2000, &tuning());
        assert_eq!(adjustment.watermark(at(10)), Priority::lowest());
    }

    #[test]
    fn test_recover_walks_one_step() {
        // target 30 (1.5% of 2000)
        let histogram = Histogram::from_counts([(10, 1970), (20, 10), (30, 25), (40, 500)]);
        let adjustment = admit_more(at(10), &histogram, 2000, &tuning());
        assert_eq!(
            adjustment,
            Adjustment::Recover {
                from: at(10),
                to: at(30),
                planned: 35,
                target: 30,
                steps: 2,
            }
        );
    }

    #[test]
    fn test_recover_already_lowest() {
        let histogram = Histogram::from_counts([(10, 5)]);
        let adjustment = admit_more(Priority::lowest(), &histogram, 5, &tuning());
        assert_eq!(adjustment, Adjustment::Unchanged(Hold::AlreadyLowest));
    }

    #[test]
    fn test_admit_compares_against_watermark() {
        let (shedder, _clock) = queue_shedder(1_000_000);
        assert!(shedder.admit(Priority::lowest()));

        let histogram = Histogram::from_counts([(5, 100), (10, 200)]);
        shedder.predict_from_histogram(&histogram, 300, 0.6);
        assert_eq!(shedder.watermark(), at(5));

        assert!(shedder.admit(at(4)));
        assert!(shedder.admit(at(5)));
        assert!(!shedder.admit(at(6)));

        let current = shedder.window().current();
        assert_eq!(current.requested(), 4);
        assert_eq!(current.admitted(), 3);
    }

    #[test]
    fn test_predict_watermark_from_window_state() {
        let (shedder, _clock) = queue_shedder(1_000_000);
        let state = WindowState::new(0);
        for _ in 0..900 {
            state.sample(at(10), true);
        }
        let adjustment = shedder.predict_watermark(&state, 0.6);
        assert!(matches!(adjustment, Adjustment::Shed { .. }));
        assert_eq!(shedder.watermark(), at(10));

        let idle = WindowState::new(0);
        shedder.predict_watermark(&idle, 1.2);
        assert_eq!(shedder.watermark(), Priority::lowest());
    }

    #[test]
    fn test_rollover_drives_prediction() {
        let (shedder, clock) = queue_shedder(100);
        shedder.mark_overloaded(clock.now_nanos()).unwrap();

        for i in 0..100u16 {
            shedder.admit(at(100 + (i % 10)));
        }
        assert_eq!(shedder.window().rollovers(), 1);
        assert!(shedder.watermark().p() < Priority::lowest().p());
        let stats = shedder.stats();
        assert_eq!(stats.sheds, 1);
        assert!(stats.last_gradient.unwrap() < 1.0);
    }

    #[test]
    fn test_recovers_after_explicit_overload_expires() {
        let (shedder, clock) = queue_shedder(100);
        shedder.mark_overloaded(clock.now_nanos()).unwrap();
        for i in 0..100u16 {
            shedder.admit(at(100 + (i % 10)));
        }
        let shed_to = shedder.watermark();
        assert!(!shed_to.is_lowest());

        clock.advance_millis(2_000);
        for i in 0..100u16 {
            shedder.admit(at(100 + (i % 10)));
        }
        assert!(shedder.watermark().p() > shed_to.p());
    }

    #[test]
    fn test_cpu_shedder_cannot_mark_overloaded() {
        let clock = Arc::new(ManualClock::new(1));
        let shedder = FairShedder::cpu(
            "CPU",
            Arc::new(FixedCpuSampler(0.2)),
            &AdmissionConfig::default(),
            clock,
        )
        .unwrap();
        assert!(shedder.mark_overloaded(1).is_err());
        assert_eq!(shedder.stats().source, "cpu");
        assert_eq!(shedder.stats().last_gradient, None);
    }

    #[test]
    fn test_cpu_shedder_sheds_under_sustained_load() {
        let clock = Arc::new(ManualClock::new(1));
        let config = AdmissionConfig {
            window_request_cycle: 50,
            ..AdmissionConfig::default()
        };
        let shedder =
            FairShedder::cpu("CPU", Arc::new(FixedCpuSampler(0.95)), &config, clock.clone())
                .unwrap();
        for round in 0..5u16 {
            for i in 0..50u16 {
                shedder.admit(at(200 + i));
            }
            clock.advance_millis(10 * u64::from(round + 1));
        }
        assert!(shedder.watermark().p() < 250);
        assert!(shedder.stats().sheds >= 1);
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let clock = Arc::new(ManualClock::new(1));
        let config = AdmissionConfig {
            window_time_cycle_ms: 0,
            ..AdmissionConfig::default()
        };
        assert!(matches!(
            FairShedder::queue("RPC", &config, clock),
            Err(AdmissionError::Configuration { .. })
        ));
    }

    #[test]
    fn test_explicit_overload_sheds_with_wide_busy_range() {
        let clock = Arc::new(ManualClock::new(1));
        let config = AdmissionConfig {
            gradient_busiest: 0.6,
            ..AdmissionConfig::default()
        };
        let shedder = FairShedder::queue("RPC", &config, clock.clone()).unwrap();
        shedder.mark_overloaded(clock.now_nanos()).unwrap();

        let snapshot = WindowState::new(0);
        for _ in 0..1_000 {
            let g = shedder.overload_gradient(clock.now_nanos(), &snapshot);
            assert!(is_overloaded(g), "healthy gradient {} during explicit overload", g);
            assert!(g >= 0.6 && g <= config.gradient_idle);
        }
    }

    #[test]
    fn test_last_gradient_from_direct_prediction() {
        let (shedder, _clock) = queue_shedder(1_000);
        shedder.predict_from_histogram(&Histogram::from_counts([(10, 900)]), 900, 0.6);
        assert_eq!(shedder.stats().last_gradient, Some(0.6));

        shedder.predict_watermark(&WindowState::new(0), 1.1);
        assert_eq!(shedder.stats().last_gradient, Some(1.1));
    }

    #[test]
    fn test_stale_prediction_is_superseded() {
        let (shedder, _clock) = queue_shedder(1_000);
        let stale = shedder.watermark();
        let histogram = Histogram::from_counts([(5, 100), (10, 200)]);
        let late = shed_more(stale, &histogram, 300, shedder.tuning());
        assert_eq!(late.watermark(stale), at(5));

        // another prediction lands first
        shedder.predict_from_histogram(&Histogram::from_counts([(10, 900)]), 900, 0.6);
        assert_eq!(shedder.watermark(), at(10));

        let outcome = shedder.publish(stale, late, 300, 0.6);
        assert_eq!(outcome, Adjustment::Unchanged(Hold::Superseded));
        assert_eq!(shedder.watermark(), at(10));
        assert_eq!(shedder.stats().holds, 1);
    }

    #[test]
    fn test_racing_predictions_publish_once() {
        let (shedder, _clock) = queue_shedder(1_000);
        let histogram = Histogram::from_counts([(10, 900)]);
        let outcomes: Vec<Adjustment> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| shedder.predict_from_histogram(&histogram, 900, 0.6)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let sheds = outcomes
            .iter()
            .filter(|a| matches!(a, Adjustment::Shed { .. }))
            .count();
        assert_eq!(sheds, 1);
        assert!(outcomes.iter().all(|a| matches!(
            a,
            Adjustment::Shed { .. }
                | Adjustment::Unchanged(Hold::Superseded)
                | Adjustment::Unchanged(Hold::NothingToShed)
        )));
        assert_eq!(shedder.watermark(), at(10));
    }

    #[test]
    fn test_reset_watermark() {
        let (shedder, _clock) = queue_shedder(1_000);
        shedder.predict_from_histogram(&Histogram::from_counts([(10, 900)]), 900, 0.5);
        assert_eq!(shedder.watermark(), at(10));
        shedder.reset_watermark();
        assert!(shedder.watermark().is_lowest());
    }
}
