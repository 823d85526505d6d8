//! Two-level workload priority.
//!
//! A priority is a pair `(B, U)` of 7-bit values folded into a single 14-bit
//! scalar `P = (B << 7) | U`. Lower `P` means more important work. `B` is the
//! coarse business class assigned at ingress; `U` splits a class into
//! sub-buckets so that overload can shed part of a class instead of all of it.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::clock::SharedClock;
use crate::error::{AdmissionError, Result};

const PRIORITY_BITS: u16 = 7;
const MAX_7BIT: u16 = (1 << PRIORITY_BITS) - 1;

/// Largest valid `P`, i.e. the lowest priority.
pub const MAX_P: u16 = (MAX_7BIT << PRIORITY_BITS) | MAX_7BIT;

/// Directly user-facing; failures are immediately visible to users.
pub const B_CRITICAL_PLUS: u8 = 5;
/// Default for synchronous user-facing requests.
pub const B_CRITICAL: u8 = 10;
/// Retryable, non-interactive work that tolerates minutes of delay.
pub const B_SHEDDABLE_PLUS: u8 = 20;
/// Work that may be dropped often and completes eventually through retries.
pub const B_SHEDDABLE: u8 = 40;

/// Immutable workload priority.
///
/// Ordering follows `P`: `a < b` means `a` is more important than `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Priority {
    b: u8,
    u: u8,
}

impl Priority {
    /// Builds a priority from its two components.
    pub fn encode(b: i32, u: i32) -> Result<Self> {
        let max = i32::from(MAX_7BIT);
        if !(0..=max).contains(&b) || !(0..=max).contains(&u) {
            return Err(AdmissionError::OutOfRange {
                b: i64::from(b),
                u: i64::from(u),
            });
        }
        Ok(Self {
            b: b as u8,
            u: u as u8,
        })
    }

    /// Rebuilds a priority from its scalar form.
    pub fn decode(p: i32) -> Result<Self> {
        if !(0..=i32::from(MAX_P)).contains(&p) {
            return Err(AdmissionError::InvalidValue(i64::from(p)));
        }
        Ok(Self::from_p(p as u16))
    }

    /// The admit-everything priority, `B = U = 127`.
    pub const fn lowest() -> Self {
        Self {
            b: MAX_7BIT as u8,
            u: MAX_7BIT as u8,
        }
    }

    /// Materialises the priority whose scalar is `target_p`.
    ///
    /// `target_p` always comes from a histogram key, which was produced by a
    /// valid priority, so values above [`MAX_P`] are masked rather than
    /// rejected.
    pub fn derive_from(target_p: u16) -> Self {
        Self::from_p(target_p & MAX_P)
    }

    fn from_p(p: u16) -> Self {
        Self {
            b: ((p >> PRIORITY_BITS) & MAX_7BIT) as u8,
            u: (p & MAX_7BIT) as u8,
        }
    }

    pub fn b(&self) -> u8 {
        self.b
    }

    pub fn u(&self) -> u8 {
        self.u
    }

    /// The normalised 14-bit scalar.
    pub fn p(&self) -> u16 {
        (u16::from(self.b) << PRIORITY_BITS) | u16::from(self.u)
    }

    pub fn is_lowest(&self) -> bool {
        self.p() == MAX_P
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::lowest()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "priority(P={},B={})", self.p(), self.b)
    }
}

impl From<Priority> for u16 {
    fn from(priority: Priority) -> Self {
        priority.p()
    }
}

impl TryFrom<u16> for Priority {
    type Error = AdmissionError;

    fn try_from(p: u16) -> Result<Self> {
        Self::decode(i32::from(p))
    }
}

#[derive(Debug, Clone, Copy)]
struct CohortState {
    u: u8,
    created_at_ms: u64,
}

/// Assigns `U` values that are stable for one period and then rotate.
///
/// Requests carrying the same uid share a `U` (and therefore a fate) for
/// `period_ms`; afterwards a fresh random `U` is drawn so that a partially
/// shed class does not starve the same entities forever. Uids are folded
/// into at most 127 cohorts, and each call probes one random cohort and drops
/// it if stale.
pub struct PeriodicRandomU {
    period_ms: u64,
    clock: SharedClock,
    cohorts: DashMap<u8, CohortState>,
}

impl PeriodicRandomU {
    pub fn new(period_ms: u64, clock: SharedClock) -> Result<Arc<Self>> {
        if period_ms == 0 {
            return Err(AdmissionError::config("periodic U period must be positive"));
        }
        Ok(Arc::new(Self {
            period_ms,
            clock,
            cohorts: DashMap::with_capacity(usize::from(MAX_7BIT)),
        }))
    }

    /// Returns a priority with business class `b` and the current `U` of the
    /// cohort that `uid` belongs to.
    pub fn priority(&self, b: i32, uid: i64) -> Result<Priority> {
        let max = i32::from(MAX_7BIT);
        if !(0..=max).contains(&b) {
            return Err(AdmissionError::OutOfRange {
                b: i64::from(b),
                u: 0,
            });
        }

        let cohort = ((uid & i64::MAX) % i64::from(MAX_7BIT)) as u8;
        let now_ms = self.clock.now_millis();
        let period_ms = self.period_ms;

        let u = {
            let mut entry = self.cohorts.entry(cohort).or_insert_with(|| {
                let u = rand::thread_rng().gen_range(0..MAX_7BIT) as u8;
                trace!(cohort, u, "new cohort U");
                CohortState {
                    u,
                    created_at_ms: now_ms,
                }
            });
            if now_ms.saturating_sub(entry.created_at_ms) > period_ms {
                entry.u = rand::thread_rng().gen_range(0..MAX_7BIT) as u8;
                entry.created_at_ms = now_ms;
                trace!(cohort, u = entry.u, "rotated cohort U");
            }
            entry.u
        };

        self.scavenge(now_ms, cohort);
        Priority::encode(b, i32::from(u))
    }

    fn scavenge(&self, now_ms: u64, current: u8) {
        let candidate = rand::thread_rng().gen_range(0..MAX_7BIT) as u8;
        if candidate == current {
            return;
        }
        let period_ms = self.period_ms;
        if self
            .cohorts
            .remove_if(&candidate, |_, state| {
                now_ms.saturating_sub(state.created_at_ms) > period_ms
            })
            .is_some()
        {
            debug!(cohort = candidate, "scavenged stale cohort");
        }
    }

    /// Number of live cohorts.
    pub fn cohorts(&self) -> usize {
        self.cohorts.len()
    }
}

impl fmt::Debug for PeriodicRandomU {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicRandomU")
            .field("period_ms", &self.period_ms)
            .field("cohorts", &self.cohorts.len())
            .finish()
    }
}
