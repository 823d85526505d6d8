//! Simulated process CPU usage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use clap::ValueEnum;
use fairgate_core::CpuSampler;
use rand::Rng;

/// Background load shape, independent of admitted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CpuProfile {
    /// Constant base usage.
    Steady,
    /// Base usage jumps to 90% for the middle third of the run.
    Spike,
    /// Base usage climbs linearly to 90% over the run.
    Ramp,
}

/// CPU model: profile-driven base load plus a share proportional to the
/// number of in-flight workloads, with some jitter.
#[derive(Debug)]
pub struct SimulatedCpu {
    profile: CpuProfile,
    base: f64,
    max_concurrency: u64,
    run_secs: f64,
    started: Instant,
    inflight: AtomicU64,
}

impl SimulatedCpu {
    pub fn new(profile: CpuProfile, base: f64, max_concurrency: u64, run_secs: u64) -> Self {
        Self {
            profile,
            base,
            max_concurrency: max_concurrency.max(1),
            run_secs: run_secs.max(1) as f64,
            started: Instant::now(),
            inflight: AtomicU64::new(0),
        }
    }

    pub fn enter(&self) -> u64 {
        self.inflight.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn exit(&self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Relaxed)
    }

    fn base_usage(&self) -> f64 {
        let progress = (self.started.elapsed().as_secs_f64() / self.run_secs).min(1.0);
        match self.profile {
            CpuProfile::Steady => self.base,
            CpuProfile::Spike if (1.0 / 3.0..2.0 / 3.0).contains(&progress) => 0.9,
            CpuProfile::Spike => self.base,
            CpuProfile::Ramp => self.base + (0.9 - self.base).max(0.0) * progress,
        }
    }
}

impl CpuSampler for SimulatedCpu {
    fn cpu_usage(&self) -> f64 {
        let load = self.inflight() as f64 / self.max_concurrency as f64 * 0.5;
        let usage = (self.base_usage() + load).min(1.0);
        let headroom = 1.0 - usage;
        let jitter = if headroom > 0.0 {
            rand::thread_rng().gen_range(0.0..headroom * 0.5)
        } else {
            0.0
        };
        usage + jitter
    }
}
