//! Counters for virtual-memory activity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Virtual memory allocator metrics collector
#[derive(Debug)]
pub struct Metrics {
    // Reservation lifecycle
    reservations: AtomicU64,
    reuses: AtomicU64,
    releases: AtomicU64,
    force_releases: AtomicU64,

    // Byte counters
    bytes_reserved: AtomicU64,
    bytes_committed: AtomicU64,
    bytes_decommitted: AtomicU64,

    failures: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            reservations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            force_releases: AtomicU64::new(0),
            bytes_reserved: AtomicU64::new(0),
            bytes_committed: AtomicU64::new(0),
            bytes_decommitted: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a brand-new OS reservation
    pub fn record_reservation(&self, bytes: usize) {
        self.reservations.fetch_add(1, Ordering::Relaxed);
        self.bytes_reserved.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record an allocation served from the free list
    pub fn record_reuse(&self) {
        self.reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_force_release(&self) {
        self.force_releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self, bytes: usize) {
        self.bytes_committed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_decommit(&self, bytes: usize) {
        self.bytes_decommitted.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Instant::now(),
            uptime: self.start_time.elapsed(),
            reservations: self.reservations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            force_releases: self.force_releases.load(Ordering::Relaxed),
            bytes_reserved: self.bytes_reserved.load(Ordering::Relaxed),
            bytes_committed: self.bytes_committed.load(Ordering::Relaxed),
            bytes_decommitted: self.bytes_decommitted.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.reservations.store(0, Ordering::Relaxed);
        self.reuses.store(0, Ordering::Relaxed);
        self.releases.store(0, Ordering::Relaxed);
        self.force_releases.store(0, Ordering::Relaxed);
        self.bytes_reserved.store(0, Ordering::Relaxed);
        self.bytes_committed.store(0, Ordering::Relaxed);
        self.bytes_decommitted.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: Instant,
    pub uptime: std::time::Duration,
    pub reservations: u64,
    pub reuses: u64,
    pub releases: u64,
    pub force_releases: u64,
    pub bytes_reserved: u64,
    pub bytes_committed: u64,
    pub bytes_decommitted: u64,
    pub failures: u64,
}

impl MetricsSnapshot {
    /// Fraction of allocations served without a new OS reservation (0.0 to 1.0)
    pub fn reuse_ratio(&self) -> f64 {
        let total = self.reservations + self.reuses;
        if total == 0 {
            return 0.0;
        }
        self.reuses as f64 / total as f64
    }

    /// Total allocations served
    pub fn allocations(&self) -> u64 {
        self.reservations + self.reuses
    }
}
