//! Admission controller facade and the per-process registry.
//!
//! Each workload kind ("HTTP", "RPC", "MQ", ...) gets one
//! [`AdmissionController`] holding its own queue shedder. All controllers of a
//! [`Registry`] share one CPU shedder, since CPU exhaustion is global.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::AdmissionConfig;
use crate::error::Result;
use crate::gradient::CpuSampler;
use crate::metrics::{MetricsTracker, NoopMetricsTracker};
use crate::priority::Priority;
use crate::shedder::{FairShedder, ShedderStats};

/// Signals reported back by the caller after admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// The workload waited this many nanoseconds before it ran.
    Queued(u64),
    /// The resource is overloaded right now, e.g. a full worker pool.
    Overloaded,
    /// The resource became overloaded at this clock time.
    OverloadedAt(u64),
}

/// Admission decision point for one workload kind.
pub struct AdmissionController {
    name: String,
    cpu: Arc<FairShedder>,
    queue: FairShedder,
    clock: SharedClock,
    metrics: Arc<dyn MetricsTracker>,
}

impl AdmissionController {
    fn new(
        name: &str,
        cpu: Arc<FairShedder>,
        config: &AdmissionConfig,
        clock: SharedClock,
        metrics: Arc<dyn MetricsTracker>,
    ) -> Result<Self> {
        let queue = FairShedder::queue(name, config, clock.clone())?;
        Ok(Self {
            name: name.to_string(),
            cpu,
            queue,
            clock,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admits `priority` only if both the CPU and the queue shedder admit it.
    ///
    /// Both shedders always see the sample, so a CPU rejection still counts
    /// as demand on this kind's queue.
    pub fn admit(&self, priority: Priority) -> bool {
        self.metrics.enter(&self.name, priority);

        let by_cpu = self.cpu.admit(priority);
        let by_queue = self.queue.admit(priority);

        if !by_cpu {
            debug!(
                name = %self.name,
                %priority,
                watermark = %self.cpu.watermark(),
                "busy CPU shed workload"
            );
            self.metrics.shed_by_cpu(&self.name, priority);
        }
        if !by_queue {
            debug!(
                name = %self.name,
                %priority,
                watermark = %self.queue.watermark(),
                "busy queue shed workload"
            );
            self.metrics.shed_by_queue(&self.name, priority);
        }

        let admitted = by_cpu && by_queue;
        if admitted {
            self.metrics.admitted(&self.name, priority);
        }
        admitted
    }

    /// Records feedback for this kind's queue shedder. Never blocks.
    pub fn feedback(&self, feedback: Feedback) {
        match feedback {
            Feedback::Queued(nanos) => {
                self.queue.add_queued_nanos(nanos);
                self.metrics.queued(&self.name, nanos);
            }
            Feedback::Overloaded => self.mark_overloaded(self.clock.now_nanos()),
            Feedback::OverloadedAt(at_nanos) => self.mark_overloaded(at_nanos),
        }
    }

    fn mark_overloaded(&self, at_nanos: u64) {
        // queue shedders always carry a queue gradient
        if self.queue.mark_overloaded(at_nanos).is_ok() {
            self.metrics.overloaded(&self.name);
        }
    }

    /// Current queue watermark of this kind.
    pub fn watermark(&self) -> Priority {
        self.queue.watermark()
    }

    /// Current watermark of the shared CPU shedder.
    pub fn cpu_watermark(&self) -> Priority {
        self.cpu.watermark()
    }

    pub fn queue_shedder(&self) -> &FairShedder {
        &self.queue
    }

    pub fn queue_stats(&self) -> ShedderStats {
        self.queue.stats()
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("name", &self.name)
            .field("watermark", &self.watermark())
            .field("cpu_watermark", &self.cpu_watermark())
            .finish()
    }
}

/// Owns the shared CPU shedder and caches one controller per kind.
///
/// Create one per process and pass it down; clones of the `Arc` share state.
pub struct Registry {
    config: AdmissionConfig,
    clock: SharedClock,
    cpu: Arc<FairShedder>,
    metrics: Arc<dyn MetricsTracker>,
    controllers: DashMap<String, Arc<AdmissionController>>,
}

impl Registry {
    pub fn new(
        config: AdmissionConfig,
        sampler: Arc<dyn CpuSampler>,
        clock: SharedClock,
    ) -> Result<Self> {
        Self::with_metrics(config, sampler, clock, Arc::new(NoopMetricsTracker))
    }

    pub fn with_metrics(
        config: AdmissionConfig,
        sampler: Arc<dyn CpuSampler>,
        clock: SharedClock,
        metrics: Arc<dyn MetricsTracker>,
    ) -> Result<Self> {
        config.validate()?;
        let cpu = Arc::new(FairShedder::cpu("CPU", sampler, &config, clock.clone())?);
        info!(
            time_cycle_ms = config.window_time_cycle_ms,
            request_cycle = config.window_request_cycle,
            "admission registry created"
        );
        Ok(Self {
            config,
            clock,
            cpu,
            metrics,
            controllers: DashMap::new(),
        })
    }

    /// Returns the controller for `name`, creating it on first use.
    ///
    /// The configuration was validated when the registry was built, so only
    /// an inconsistent custom clock or sampler can make this fail.
    pub fn controller(&self, name: &str) -> Result<Arc<AdmissionController>> {
        if let Some(existing) = self.controllers.get(name) {
            return Ok(Arc::clone(existing.value()));
        }

        let entry = self.controllers.entry(name.to_string());
        let controller = match entry {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let controller = Arc::new(AdmissionController::new(
                    name,
                    Arc::clone(&self.cpu),
                    &self.config,
                    self.clock.clone(),
                    Arc::clone(&self.metrics),
                )?);
                info!(name = %name, "register new admission controller");
                vacant.insert(Arc::clone(&controller));
                controller
            }
        };
        Ok(controller)
    }

    /// Names of all registered kinds, sorted.
    pub fn controllers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .controllers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    pub fn cpu_shedder(&self) -> &FairShedder {
        &self.cpu
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Stats of the CPU shedder followed by every queue shedder, by name.
    pub fn stats(&self) -> Vec<ShedderStats> {
        let mut stats = vec![self.cpu.stats()];
        for name in self.controllers() {
            if let Some(controller) = self.controllers.get(&name) {
                stats.push(controller.queue_stats());
            }
        }
        stats
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("controllers", &self.controllers())
            .field("cpu", &self.cpu)
            .finish()
    }
}
