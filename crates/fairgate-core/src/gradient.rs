//! Overload gradient sources.
//!
//! A gradient summarises how loaded the protected resource was over the
//! window that just closed: `1.0` is on target, smaller is overloaded, and
//! values are clamped to `[busiest, idle]`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::clock::NANOS_PER_MILLI;
use crate::error::{AdmissionError, Result};
use crate::window::WindowState;

/// Gradient at which the resource is exactly at its target.
pub const GRADIENT_HEALTHY: f64 = 1.0;

/// Clamp range for gradients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientBounds {
    /// Most overloaded value a source may report, below [`GRADIENT_HEALTHY`].
    pub busiest: f64,
    /// Value reported for an idle resource, above [`GRADIENT_HEALTHY`].
    pub idle: f64,
}

impl GradientBounds {
    pub fn clamp(&self, raw: f64) -> f64 {
        if raw.is_nan() {
            return self.idle;
        }
        raw.clamp(self.busiest, self.idle)
    }

    /// `bound / observed`, clamped. An idle observation yields `idle`.
    pub fn ratio(&self, bound: f64, observed: f64) -> f64 {
        if observed <= 0.0 {
            return self.idle;
        }
        self.clamp(bound / observed)
    }
}

impl Default for GradientBounds {
    fn default() -> Self {
        Self {
            busiest: 0.5,
            idle: 1.2,
        }
    }
}

pub fn is_overloaded(gradient: f64) -> bool {
    gradient < GRADIENT_HEALTHY
}

/// Source of the process CPU utilisation, polled once per rollover.
pub trait CpuSampler: Send + Sync {
    /// Most recent utilisation in `[0, 1]`.
    fn cpu_usage(&self) -> f64;
}

/// Sampler that always reports the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedCpuSampler(pub f64);

impl CpuSampler for FixedCpuSampler {
    fn cpu_usage(&self) -> f64 {
        self.0
    }
}

/// Sampler whose value is set by its owner, e.g. a background poller.
#[derive(Debug, Default)]
pub struct ManualCpuSampler {
    bits: AtomicU64,
}

impl ManualCpuSampler {
    pub fn new(usage: f64) -> Self {
        Self {
            bits: AtomicU64::new(usage.to_bits()),
        }
    }

    pub fn set(&self, usage: f64) {
        self.bits.store(usage.to_bits(), Ordering::Relaxed);
    }
}

impl CpuSampler for ManualCpuSampler {
    fn cpu_usage(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Exponential moving average; the first sample seeds the average.
#[derive(Debug)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    current: Mutex<Option<f64>>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(AdmissionError::config(format!(
                "EMA alpha must be in (0, 1], got {}",
                alpha
            )));
        }
        Ok(Self {
            alpha,
            current: Mutex::new(None),
        })
    }

    /// Folds in a sample and returns the new average.
    pub fn update(&self, sample: f64) -> f64 {
        let mut current = self.current.lock();
        let next = match *current {
            None => sample,
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
        };
        *current = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        *self.current.lock()
    }
}

/// CPU-based gradient: `upper_bound / ema(cpu_usage)`.
pub struct CpuGradient {
    sampler: Arc<dyn CpuSampler>,
    upper_bound: f64,
    ema: ExponentialMovingAverage,
}

impl CpuGradient {
    pub fn new(sampler: Arc<dyn CpuSampler>, upper_bound: f64, alpha: f64) -> Result<Self> {
        if !(upper_bound > 0.0 && upper_bound <= 1.0) {
            return Err(AdmissionError::config(format!(
                "CPU upper bound must be in (0, 1], got {}",
                upper_bound
            )));
        }
        Ok(Self {
            sampler,
            upper_bound,
            ema: ExponentialMovingAverage::new(alpha)?,
        })
    }

    fn smoothed_usage(&self) -> f64 {
        let raw = self.sampler.cpu_usage();
        let usage = if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 1.0) };
        let smoothed = self.ema.update(usage);
        debug!(usage, smoothed, "cpu usage sampled");
        smoothed
    }

    fn gradient(&self, bounds: &GradientBounds) -> f64 {
        let usage = self.smoothed_usage();
        let gradient = bounds.ratio(self.upper_bound, usage);
        if is_overloaded(gradient) {
            warn!(usage, upper_bound = self.upper_bound, gradient, "CPU busy");
        }
        gradient
    }

    pub fn smoothed(&self) -> Option<f64> {
        self.ema.value()
    }
}

impl fmt::Debug for CpuGradient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuGradient")
            .field("upper_bound", &self.upper_bound)
            .field("ema", &self.ema)
            .finish()
    }
}

const NEVER: u64 = u64::MAX;

/// Queue-delay gradient with an explicit-overload override.
#[derive(Debug)]
pub struct QueueGradient {
    avg_queued_ms_upper_bound: f64,
    overload_ttl_nanos: u64,
    overloaded_at: AtomicU64,
}

impl QueueGradient {
    /// `overload_ttl_nanos` is how long an explicit overload signal holds;
    /// it equals one window time cycle.
    pub fn new(avg_queued_ms_upper_bound: f64, overload_ttl_nanos: u64) -> Result<Self> {
        if !(avg_queued_ms_upper_bound > 0.0) {
            return Err(AdmissionError::config(format!(
                "average queue upper bound must be positive, got {}",
                avg_queued_ms_upper_bound
            )));
        }
        Ok(Self {
            avg_queued_ms_upper_bound,
            overload_ttl_nanos,
            overloaded_at: AtomicU64::new(NEVER),
        })
    }

    /// Records an explicit overload signal observed at `at_nanos`.
    pub fn mark_overloaded(&self, at_nanos: u64) {
        self.overloaded_at.store(at_nanos, Ordering::Release);
    }

    pub fn clear_overloaded(&self) {
        self.overloaded_at.store(NEVER, Ordering::Release);
    }

    pub fn explicitly_overloaded(&self, now_nanos: u64) -> bool {
        let at = self.overloaded_at.load(Ordering::Acquire);
        at != NEVER && now_nanos.saturating_sub(at) <= self.overload_ttl_nanos
    }

    /// Random value in `[busiest, GRADIENT_HEALTHY)`, so an explicit signal
    /// is always read as overload.
    fn explicit_gradient(bounds: &GradientBounds) -> f64 {
        if bounds.busiest >= GRADIENT_HEALTHY {
            return bounds.busiest;
        }
        rand::thread_rng().gen_range(bounds.busiest..GRADIENT_HEALTHY)
    }

    fn gradient(&self, now_nanos: u64, snapshot: &WindowState, bounds: &GradientBounds) -> f64 {
        if self.explicitly_overloaded(now_nanos) {
            let gradient = Self::explicit_gradient(bounds);
            info!(
                ttl_ms = self.overload_ttl_nanos / NANOS_PER_MILLI,
                gradient, "still in explicit overload interval"
            );
            return gradient;
        }

        let avg_ms = snapshot.avg_queued_ms();
        let gradient = bounds.ratio(self.avg_queued_ms_upper_bound, avg_ms);
        if gradient < bounds.idle {
            info!(
                avg_queued_ms = avg_ms,
                upper_bound = self.avg_queued_ms_upper_bound,
                gradient,
                "queueing delay rising"
            );
        }
        gradient
    }
}

/// The closed set of overload signals a shedder can adapt to.
#[derive(Debug)]
pub enum GradientSource {
    Cpu(CpuGradient),
    Queue(QueueGradient),
}

impl GradientSource {
    /// Gradient for the window `snapshot` that closed at `now_nanos`.
    pub fn overload_gradient(
        &self,
        now_nanos: u64,
        snapshot: &WindowState,
        bounds: &GradientBounds,
    ) -> f64 {
        match self {
            GradientSource::Cpu(cpu) => cpu.gradient(bounds),
            GradientSource::Queue(queue) => queue.gradient(now_nanos, snapshot, bounds),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GradientSource::Cpu(_) => "cpu",
            GradientSource::Queue(_) => "queue",
        }
    }

    pub fn as_queue(&self) -> Option<&QueueGradient> {
        match self {
            GradientSource::Queue(queue) => Some(queue),
            GradientSource::Cpu(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::Priority;

    const CYCLE: u64 = 1_000 * NANOS_PER_MILLI;

    #[test]
    fn test_bounds_ratio() {
        let bounds = GradientBounds::default();
        assert_eq!(bounds.ratio(0.75, 0.0), 1.2);
        assert_eq!(bounds.ratio(0.75, 0.75), 1.0);
        assert_eq!(bounds.ratio(0.75, 1.0), 0.75);
        assert_eq!(bounds.ratio(0.5, 1.0), 0.5);
        assert_eq!(bounds.ratio(0.1, 1.0), 0.5);
        assert_eq!(bounds.ratio(50.0, 10.0), 1.2);
    }

    #[test]
    fn test_is_overloaded() {
        assert!(is_overloaded(0.99));
        assert!(!is_overloaded(1.0));
        assert!(!is_overloaded(1.2));
    }

    #[test]
    fn test_ema_seeds_then_smooths() {
        let ema = ExponentialMovingAverage::new(0.25).unwrap();
        assert_eq!(ema.value(), None);
        assert_eq!(ema.update(0.8), 0.8);
        let next = ema.update(0.0);
        assert!((next - 0.6).abs() < 1e-9);
        assert!(ExponentialMovingAverage::new(0.0).is_err());
        assert!(ExponentialMovingAverage::new(1.1).is_err());
    }

    #[test]
    fn test_cpu_gradient_smooths_burst() {
        let sampler = Arc::new(ManualCpuSampler::new(0.3));
        let source = GradientSource::Cpu(
            CpuGradient::new(sampler.clone(), 0.75, 0.25).unwrap(),
        );
        let bounds = GradientBounds::default();
        let snapshot = WindowState::new(0);

        assert_eq!(source.overload_gradient(0, &snapshot, &bounds), 1.2);

        // one 100% burst: smoothed 0.475, still healthy
        sampler.set(1.0);
        let g = source.overload_gradient(0, &snapshot, &bounds);
        assert!(!is_overloaded(g));

        // sustained load eventually crosses the bound
        let mut g = g;
        for _ in 0..10 {
            g = source.overload_gradient(0, &snapshot, &bounds);
        }
        assert!(is_overloaded(g));
        assert!(g >= bounds.busiest);
    }

    #[test]
    fn test_cpu_gradient_clamps_sampler_noise() {
        let source = CpuGradient::new(Arc::new(FixedCpuSampler(7.0)), 0.75, 1.0).unwrap();
        let g = source.gradient(&GradientBounds::default());
        assert_eq!(g, 0.75);
        assert_eq!(source.smoothed(), Some(1.0));

        let source = CpuGradient::new(Arc::new(FixedCpuSampler(-1.0)), 0.75, 1.0).unwrap();
        assert_eq!(source.gradient(&GradientBounds::default()), 1.2);
        assert!(CpuGradient::new(Arc::new(FixedCpuSampler(0.1)), 0.0, 0.25).is_err());
    }

    #[test]
    fn test_queue_gradient_from_average_delay() {
        let queue = QueueGradient::new(50.0, CYCLE).unwrap();
        let bounds = GradientBounds::default();

        let empty = WindowState::new(0);
        assert_eq!(queue.gradient(1, &empty, &bounds), 1.2);

        let busy = WindowState::new(0);
        for _ in 0..10 {
            busy.sample(Priority::lowest(), true);
        }
        busy.add_queued_nanos(10 * 100 * NANOS_PER_MILLI);
        assert_eq!(queue.gradient(1, &busy, &bounds), 0.5);

        let mild = WindowState::new(0);
        mild.sample(Priority::lowest(), true);
        mild.add_queued_nanos(62_500_000);
        assert!((queue.gradient(1, &mild, &bounds) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_explicit_overload_ttl() {
        let source = GradientSource::Queue(QueueGradient::new(50.0, CYCLE).unwrap());
        let bounds = GradientBounds::default();
        let snapshot = WindowState::new(0);

        source.as_queue().unwrap().mark_overloaded(0);

        let g = source.overload_gradient(CYCLE - 1, &snapshot, &bounds);
        assert!(g < bounds.idle);
        assert!(is_overloaded(g));
        assert!(g >= bounds.busiest);

        let g = source.overload_gradient(CYCLE + 1, &snapshot, &bounds);
        assert_eq!(g, bounds.idle);
    }

    #[test]
    fn test_explicit_gradient_stays_overloaded_for_wide_busy_range() {
        for busiest in [0.6, 0.75, 0.95] {
            let bounds = GradientBounds { busiest, idle: 1.2 };
            let source = GradientSource::Queue(QueueGradient::new(50.0, CYCLE).unwrap());
            let snapshot = WindowState::new(0);
            source.as_queue().unwrap().mark_overloaded(0);

            for _ in 0..1_000 {
                let g = source.overload_gradient(1, &snapshot, &bounds);
                assert!(is_overloaded(g), "busiest={} gave {}", busiest, g);
                assert!(g >= bounds.busiest);
                assert!(g <= bounds.idle);
            }
        }
    }

    #[test]
    fn test_explicit_overload_cleared() {
        let queue = QueueGradient::new(50.0, CYCLE).unwrap();
        assert!(!queue.explicitly_overloaded(5));
        queue.mark_overloaded(5);
        assert!(queue.explicitly_overloaded(5));
        queue.clear_overloaded();
        assert!(!queue.explicitly_overloaded(5));
    }

    #[test]
    fn test_source_kind() {
        let cpu = GradientSource::Cpu(
            CpuGradient::new(Arc::new(FixedCpuSampler(0.1)), 0.75, 0.25).unwrap(),
        );
        assert_eq!(cpu.kind(), "cpu");
        assert!(cpu.as_queue().is_none());
    }
}
