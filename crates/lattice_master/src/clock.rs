//! Hybrid-logical timestamps and the cluster clock seam.
//!
//! These types are kept in a small, dependency-light module because they are
//! shared by the catalog records, the backfill job, and the shard RPC layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Bits reserved for the logical component of a hybrid timestamp.
pub const LOGICAL_BITS: u32 = 12;

/// A hybrid-logical timestamp: physical microseconds since the unix epoch in
/// the high bits, a logical counter in the low [`LOGICAL_BITS`] bits. The raw
/// u64 encoding is totally ordered and `0` is the invalid sentinel.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HybridTimestamp(u64);

impl HybridTimestamp {
    pub const INVALID: HybridTimestamp = HybridTimestamp(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn from_micros(micros: u64) -> Self {
        Self(micros << LOGICAL_BITS)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub fn physical_micros(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Raise `self` to at least `other`.
    pub fn make_at_least(&mut self, other: HybridTimestamp) {
        if other.0 > self.0 {
            self.0 = other.0;
        }
    }
}

impl std::fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{{ physical_us: {} logical: {} }}", self.physical_micros(), self.0 & ((1 << LOGICAL_BITS) - 1))
        } else {
            write!(f, "<invalid>")
        }
    }
}

/// Cluster clock seam. Every shard response carries a propagated hybrid time
/// which the caller feeds back through [`HybridClock::observe`] so the local
/// clock never runs behind a remote one it has heard from.
pub trait HybridClock: Send + Sync + 'static {
    fn now(&self) -> HybridTimestamp;
    fn observe(&self, remote: HybridTimestamp);
}

/// Wall-clock-backed hybrid clock. `now` is strictly increasing across calls
/// even when the wall clock stalls, by bumping the logical component.
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    fn wall_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridClock for SystemClock {
    fn now(&self) -> HybridTimestamp {
        let physical = HybridTimestamp::from_micros(Self::wall_micros()).as_raw();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = physical.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return HybridTimestamp::from_raw(next),
                Err(observed) => prev = observed,
            }
        }
    }

    fn observe(&self, remote: HybridTimestamp) {
        self.last.fetch_max(remote.as_raw(), Ordering::AcqRel);
    }
}

/// Deterministic clock for tests and embedders that drive time explicitly.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: HybridTimestamp) -> Self {
        Self {
            now: AtomicU64::new(start.as_raw()),
        }
    }

    pub fn set(&self, ts: HybridTimestamp) {
        self.now.store(ts.as_raw(), Ordering::Release);
    }
}

impl HybridClock for ManualClock {
    fn now(&self) -> HybridTimestamp {
        HybridTimestamp::from_raw(self.now.load(Ordering::Acquire))
    }

    fn observe(&self, remote: HybridTimestamp) {
        self.now.fetch_max(remote.as_raw(), Ordering::AcqRel);
    }
}
