//! fairgate-sim: drives a mixed-priority workload through an admission
//! registry under a simulated CPU profile and prints a JSON summary.

mod cpu;
mod workload;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fairgate_core::{
    AdmissionConfig, AdmissionController, AdmissionMetrics, AdmissionMetricsSnapshot, Feedback,
    MonotonicClock, PeriodicRandomU, Registry, SharedClock, ShedderStats,
};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cpu::{CpuProfile, SimulatedCpu};
use crate::workload::{KindSummary, KindTally, WorkloadKind, KINDS};

#[derive(Parser, Debug)]
#[command(name = "fairgate-sim")]
#[command(about = "Simulate prioritized load against fairgate admission control", long_about = None)]
struct Args {
    /// Run length in seconds
    #[arg(short, long, default_value = "10")]
    duration_secs: u64,

    /// TOML or JSON hyperparameter file; FAIRGATE_* variables still override it
    #[arg(short, long, env = "FAIRGATE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "spike")]
    profile: CpuProfile,

    /// Background CPU usage outside the spike
    #[arg(long, default_value = "0.2")]
    base_cpu: f64,

    /// Workloads served concurrently before the rest queue up
    #[arg(long, default_value = "200")]
    max_concurrency: u64,

    /// Workloads generated per tick
    #[arg(short, long, default_value = "40")]
    rate: u64,

    #[arg(long, default_value = "10")]
    tick_ms: u64,

    /// How long a uid keeps its U before it is reshuffled
    #[arg(long, default_value = "2000")]
    u_period_ms: u64,
}

#[derive(Debug, Serialize)]
struct Summary {
    duration_secs: u64,
    profile: String,
    config: AdmissionConfig,
    totals: AdmissionMetricsSnapshot,
    kinds: Vec<KindSummary>,
    shedders: Vec<ShedderStats>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    info!(?args, "fairgate simulator starting");

    let config = match &args.config {
        Some(path) => AdmissionConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?
            .with_overrides(|key| std::env::var(key).ok())?,
        None => AdmissionConfig::from_env()?,
    };

    let clock: SharedClock = Arc::new(MonotonicClock::new());
    let cpu = Arc::new(SimulatedCpu::new(
        args.profile,
        args.base_cpu,
        args.max_concurrency,
        args.duration_secs,
    ));
    let metrics = Arc::new(AdmissionMetrics::new());
    let registry = Registry::with_metrics(config.clone(), cpu.clone(), clock.clone(), metrics.clone())?;
    let rotator = PeriodicRandomU::new(args.u_period_ms, clock)?;

    let tallies: Arc<HashMap<&'static str, KindTally>> =
        Arc::new(KINDS.iter().map(|k| (k.name, KindTally::default())).collect());
    let workers = Arc::new(Semaphore::new(args.max_concurrency as usize));

    let total_weight = workload::total_weight();
    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    let ticks_per_report = (1000 / args.tick_ms.max(1)).max(1);
    let mut ticks = 0u64;

    while Instant::now() < deadline {
        ticker.tick().await;
        ticks += 1;

        for _ in 0..args.rate {
            let (kind, uid) = {
                let mut rng = rand::thread_rng();
                let kind = workload::pick(rng.gen_range(0..total_weight));
                (kind, rng.gen_range(0..kind.uids))
            };
            let priority = rotator.priority(i32::from(kind.b), uid)?;
            let controller = registry.controller(kind.name)?;
            let tally = &tallies[kind.name];

            tally.requested.fetch_add(1, Ordering::Relaxed);
            if !controller.admit(priority) {
                continue;
            }
            tally.admitted.fetch_add(1, Ordering::Relaxed);

            cpu.enter();
            if workers.available_permits() == 0 {
                controller.feedback(Feedback::Overloaded);
            }
            tokio::spawn(serve(
                controller,
                *kind,
                Arc::clone(&cpu),
                Arc::clone(&workers),
                Arc::clone(&tallies),
            ));
        }

        if ticks % ticks_per_report == 0 {
            info!(
                inflight = cpu.inflight(),
                cpu_watermark = %registry.cpu_shedder().watermark(),
                shed_ratio = metrics.snapshot().shed_ratio,
                "progress"
            );
        }
    }

    drain(&cpu, Duration::from_secs(5)).await;

    let summary = Summary {
        duration_secs: args.duration_secs,
        profile: format!("{:?}", args.profile),
        config,
        totals: metrics.snapshot(),
        kinds: KINDS
            .iter()
            .map(|k| tallies[k.name].summary(k.name))
            .collect(),
        shedders: registry.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Waits for a worker slot, reports the wait as queueing delay, then holds
/// the slot for the kind's service time.
async fn serve(
    controller: Arc<AdmissionController>,
    kind: WorkloadKind,
    cpu: Arc<SimulatedCpu>,
    workers: Arc<Semaphore>,
    tallies: Arc<HashMap<&'static str, KindTally>>,
) {
    let enqueued = Instant::now();
    let permit = match workers.acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => {
            warn!(kind = kind.name, error = %e, "worker pool closed");
            cpu.exit();
            return;
        }
    };
    let waited = enqueued.elapsed();
    controller.feedback(Feedback::Queued(waited.as_nanos() as u64));

    tokio::time::sleep(Duration::from_millis(kind.service_ms)).await;
    drop(permit);
    cpu.exit();
    tallies[kind.name].completed.fetch_add(1, Ordering::Relaxed);
}

async fn drain(cpu: &SimulatedCpu, limit: Duration) {
    let deadline = Instant::now() + limit;
    while cpu.inflight() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if cpu.inflight() > 0 {
        warn!(inflight = cpu.inflight(), "gave up waiting for in-flight workloads");
    }
}
