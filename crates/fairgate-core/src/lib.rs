//! fairgate: adaptive priority-watermark admission control.
//!
//! Workloads carry a two-level [`Priority`]. Each [`FairShedder`] keeps a
//! watermark and admits work at or above it in importance; tumbling windows
//! sample demand and move the watermark by overload gradients derived from
//! CPU usage and reported queueing delay. An [`AdmissionController`] combines
//! the process-wide CPU shedder with a per-kind queue shedder, and a
//! [`Registry`] hands out one controller per kind.

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod gradient;
pub mod metrics;
pub mod priority;
pub mod shedder;
pub mod window;

pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock, NANOS_PER_MILLI};
pub use config::AdmissionConfig;
pub use controller::{AdmissionController, Feedback, Registry};
pub use error::{AdmissionError, Result};
pub use gradient::{
    CpuSampler, FixedCpuSampler, GradientBounds, GradientSource, ManualCpuSampler,
    GRADIENT_HEALTHY,
};
pub use metrics::{AdmissionMetrics, AdmissionMetricsSnapshot, MetricsTracker, NoopMetricsTracker};
pub use priority::{
    PeriodicRandomU, Priority, B_CRITICAL, B_CRITICAL_PLUS, B_SHEDDABLE, B_SHEDDABLE_PLUS, MAX_P,
};
pub use shedder::{Adjustment, FairShedder, Hold, ShedderStats, ShedderTuning};
pub use window::{
    CountAndTimeRollover, CountRollover, Histogram, RolloverStrategy, TimeRollover,
    TumblingWindow, WindowConfig, WindowState,
};
