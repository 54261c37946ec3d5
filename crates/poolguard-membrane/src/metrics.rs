//! Atomic counters for runtime observability.
//!
//! All counters use relaxed ordering. They are advisory and never used for
//! synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Runtime operation counters.
pub struct RuntimeMetrics {
    pub pools_created: AtomicU64,
    pub pools_destroyed: AtomicU64,
    pub registrations: AtomicU64,
    pub unregistrations: AtomicU64,
    /// Bounds, alignment and exact checks performed.
    pub checks: AtomicU64,
    /// Pointers accepted because their provenance was unproven.
    pub incomplete_passes: AtomicU64,
    pub external_hits: AtomicU64,
    pub warnings: AtomicU64,
    pub faults: AtomicU64,
}

impl RuntimeMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pools_created: AtomicU64::new(0),
            pools_destroyed: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            unregistrations: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            incomplete_passes: AtomicU64::new(0),
            external_hits: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pools_created: Self::get(&self.pools_created),
            pools_destroyed: Self::get(&self.pools_destroyed),
            registrations: Self::get(&self.registrations),
            unregistrations: Self::get(&self.unregistrations),
            checks: Self::get(&self.checks),
            incomplete_passes: Self::get(&self.incomplete_passes),
            external_hits: Self::get(&self.external_hits),
            warnings: Self::get(&self.warnings),
            faults: Self::get(&self.faults),
        }
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`RuntimeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub pools_created: u64,
    pub pools_destroyed: u64,
    pub registrations: u64,
    pub unregistrations: u64,
    pub checks: u64,
    pub incomplete_passes: u64,
    pub external_hits: u64,
    pub warnings: u64,
    pub faults: u64,
}

impl MetricsSnapshot {
    /// Warnings plus faults.
    #[must_use]
    pub const fn violations(&self) -> u64 {
        self.warnings + self.faults
    }
}
