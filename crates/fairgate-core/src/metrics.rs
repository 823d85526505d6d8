//! Admission metrics collection.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::priority::Priority;

/// Hooks called by an admission controller on every decision.
///
/// All methods default to no-ops so implementors pick what they record.
/// Calls happen on the admission hot path and must not block.
pub trait MetricsTracker: Send + Sync {
    /// A workload asked for admission.
    fn enter(&self, _kind: &str, _priority: Priority) {}

    /// A workload was let through by every shedder.
    fn admitted(&self, _kind: &str, _priority: Priority) {}

    /// The CPU shedder rejected a workload.
    fn shed_by_cpu(&self, _kind: &str, _priority: Priority) {}

    /// The queue shedder of `kind` rejected a workload.
    fn shed_by_queue(&self, _kind: &str, _priority: Priority) {}

    /// Queueing delay was reported back.
    fn queued(&self, _kind: &str, _nanos: u64) {}

    /// Explicit overload was reported back.
    fn overloaded(&self, _kind: &str) {}
}

/// Tracker that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsTracker;

impl MetricsTracker for NoopMetricsTracker {}

/// Point-in-time view of [`AdmissionMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdmissionMetricsSnapshot {
    pub entered: u64,
    pub admitted: u64,
    pub shed_by_cpu: u64,
    pub shed_by_queue: u64,
    pub queued_nanos: u64,
    pub overload_signals: u64,
    /// Share of entered workloads that were rejected, in `[0, 1]`.
    pub shed_ratio: f64,
}

/// Lock-free counters aggregated across all kinds.
pub struct AdmissionMetrics {
    entered: AtomicU64,
    admitted: AtomicU64,
    shed_by_cpu: AtomicU64,
    shed_by_queue: AtomicU64,
    queued_nanos: AtomicU64,
    overload_signals: AtomicU64,
}

impl Default for AdmissionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AdmissionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl AdmissionMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entered: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            shed_by_cpu: AtomicU64::new(0),
            shed_by_queue: AtomicU64::new(0),
            queued_nanos: AtomicU64::new(0),
            overload_signals: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> AdmissionMetricsSnapshot {
        let entered = self.entered.load(Ordering::Relaxed);
        let admitted = self.admitted.load(Ordering::Relaxed);
        let shed_ratio = if entered == 0 {
            0.0
        } else {
            entered.saturating_sub(admitted) as f64 / entered as f64
        };
        AdmissionMetricsSnapshot {
            entered,
            admitted,
            shed_by_cpu: self.shed_by_cpu.load(Ordering::Relaxed),
            shed_by_queue: self.shed_by_queue.load(Ordering::Relaxed),
            queued_nanos: self.queued_nanos.load(Ordering::Relaxed),
            overload_signals: self.overload_signals.load(Ordering::Relaxed),
            shed_ratio,
        }
    }

    pub fn reset(&self) {
        self.entered.store(0, Ordering::Relaxed);
        self.admitted.store(0, Ordering::Relaxed);
        self.shed_by_cpu.store(0, Ordering::Relaxed);
        self.shed_by_queue.store(0, Ordering::Relaxed);
        self.queued_nanos.store(0, Ordering::Relaxed);
        self.overload_signals.store(0, Ordering::Relaxed);
    }
}

impl MetricsTracker for AdmissionMetrics {
    fn enter(&self, _kind: &str, _priority: Priority) {
        self.entered.fetch_add(1, Ordering::Relaxed);
    }

    fn admitted(&self, _kind: &str, _priority: Priority) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    fn shed_by_cpu(&self, _kind: &str, _priority: Priority) {
        self.shed_by_cpu.fetch_add(1, Ordering::Relaxed);
    }

    fn shed_by_queue(&self, _kind: &str, _priority: Priority) {
        self.shed_by_queue.fetch_add(1, Ordering::Relaxed);
    }

    fn queued(&self, _kind: &str, nanos: u64) {
        self.queued_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    fn overloaded(&self, _kind: &str) {
        self.overload_signals.fetch_add(1, Ordering::Relaxed);
    }
}
