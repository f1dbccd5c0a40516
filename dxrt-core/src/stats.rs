//! Process-wide service counters.
//!
//! One const-initialized static, atomics only, no lock on the hot path —
//! the same `GLOBAL_STATS` shape `nvme-driver`'s `stats.rs` uses for its
//! I/O counters, scaled down to the handful of scheduler-level counters
//! this daemon actually needs (request lifecycle, memory, faults, reaped
//! processes) rather than per-byte throughput/latency histograms.

use std::sync::atomic::{AtomicU64, Ordering};

pub static GLOBAL_STATS: ServiceStats = ServiceStats::new();

pub struct ServiceStats {
    requests_dispatched: AtomicU64,
    requests_completed: AtomicU64,
    requests_errored: AtomicU64,
    bytes_allocated: AtomicU64,
    bytes_freed: AtomicU64,
    device_faults: AtomicU64,
    processes_reaped: AtomicU64,
}

/// Point-in-time read of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests_dispatched: u64,
    pub requests_completed: u64,
    pub requests_errored: u64,
    pub bytes_allocated: u64,
    pub bytes_freed: u64,
    pub device_faults: u64,
    pub processes_reaped: u64,
}

impl ServiceStats {
    pub const fn new() -> Self {
        Self {
            requests_dispatched: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_errored: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            bytes_freed: AtomicU64::new(0),
            device_faults: AtomicU64::new(0),
            processes_reaped: AtomicU64::new(0),
        }
    }

    pub fn record_dispatch(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.requests_errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alloc(&self, bytes: u64) {
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_free(&self, bytes: u64) {
        self.bytes_freed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.device_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_process_reaped(&self) {
        self.processes_reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_errored: self.requests_errored.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
            device_faults: self.device_faults.load(Ordering::Relaxed),
            processes_reaped: self.processes_reaped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let stats = ServiceStats::new();
        stats.record_dispatch();
        stats.record_dispatch();
        stats.record_completion();
        stats.record_alloc(4096);
        stats.record_free(1024);

        let snap = stats.snapshot();
        assert_eq!(snap.requests_dispatched, 2);
        assert_eq!(snap.requests_completed, 1);
        assert_eq!(snap.bytes_allocated, 4096);
        assert_eq!(snap.bytes_freed, 1024);
        assert_eq!(snap.requests_errored, 0);
    }
}
