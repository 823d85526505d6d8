//! Mixed workload definitions and per-kind tallies.

use std::sync::atomic::{AtomicU64, Ordering};

use fairgate_core::{B_CRITICAL, B_CRITICAL_PLUS, B_SHEDDABLE, B_SHEDDABLE_PLUS};
use serde::Serialize;

/// One simulated traffic source.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadKind {
    /// Controller name in the registry.
    pub name: &'static str,
    /// Business class assigned at ingress.
    pub b: u8,
    /// Share of generated traffic, relative to the other kinds.
    pub weight: u32,
    /// Time a worker slot is held per workload.
    pub service_ms: u64,
    /// Distinct uids the kind draws from.
    pub uids: i64,
}

pub static KINDS: [WorkloadKind; 4] = [
    WorkloadKind {
        name: "WEB",
        b: B_CRITICAL_PLUS,
        weight: 3,
        service_ms: 5,
        uids: 10_000,
    },
    WorkloadKind {
        name: "RPC",
        b: B_CRITICAL,
        weight: 4,
        service_ms: 8,
        uids: 1_000,
    },
    WorkloadKind {
        name: "MQ",
        b: B_SHEDDABLE_PLUS,
        weight: 2,
        service_ms: 20,
        uids: 200,
    },
    WorkloadKind {
        name: "LOW",
        b: B_SHEDDABLE,
        weight: 1,
        service_ms: 50,
        uids: 50,
    },
];

/// Picks a kind by weight from a uniform draw in `[0, total_weight)`.
pub fn pick(draw: u32) -> &'static WorkloadKind {
    let mut remaining = draw;
    for kind in &KINDS {
        if remaining < kind.weight {
            return kind;
        }
        remaining -= kind.weight;
    }
    &KINDS[KINDS.len() - 1]
}

pub fn total_weight() -> u32 {
    KINDS.iter().map(|k| k.weight).sum()
}

#[derive(Debug, Default)]
pub struct KindTally {
    pub requested: AtomicU64,
    pub admitted: AtomicU64,
    pub completed: AtomicU64,
}

impl KindTally {
    pub fn summary(&self, name: &str) -> KindSummary {
        let requested = self.requested.load(Ordering::Relaxed);
        let admitted = self.admitted.load(Ordering::Relaxed);
        KindSummary {
            name: name.to_string(),
            requested,
            admitted,
            completed: self.completed.load(Ordering::Relaxed),
            shed_ratio: if requested == 0 {
                0.0
            } else {
                (requested - admitted.min(requested)) as f64 / requested as f64
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KindSummary {
    pub name: String,
    pub requested: u64,
    pub admitted: u64,
    pub completed: u64,
    pub shed_ratio: f64,
}
