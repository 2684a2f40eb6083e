//! Per-binding counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Cheap atomic counters recorded by the engine as a binding runs. One
/// instance per binding; snapshot whenever, from any thread.
#[derive(Debug, Default)]
pub struct Metrics {
    direct_dispatches: AtomicU64,
    queued_tasks: AtomicU64,
    queue_overflows: AtomicU64,
    sniffs_completed: AtomicU64,
    filters_installed: AtomicU64,
    redirects_followed: AtomicU64,
    results_delivered: AtomicU64,
    bytes_delivered: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn direct_dispatch(&self) {
        self.direct_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_queued(&self) {
        self.queued_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_overflow(&self) {
        self.queue_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sniff_completed(&self) {
        self.sniffs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn filter_installed(&self) {
        self.filters_installed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn redirect_followed(&self) {
        self.redirects_followed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn result_delivered(&self) {
        self.results_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_delivered(&self, n: u64) {
        self.bytes_delivered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            direct_dispatches: self.direct_dispatches.load(Ordering::Relaxed),
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            sniffs_completed: self.sniffs_completed.load(Ordering::Relaxed),
            filters_installed: self.filters_installed.load(Ordering::Relaxed),
            redirects_followed: self.redirects_followed.load(Ordering::Relaxed),
            results_delivered: self.results_delivered.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub direct_dispatches: u64,
    pub queued_tasks: u64,
    pub queue_overflows: u64,
    pub sniffs_completed: u64,
    pub filters_installed: u64,
    pub redirects_followed: u64,
    pub results_delivered: u64,
    pub bytes_delivered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.direct_dispatch();
        metrics.direct_dispatch();
        metrics.task_queued();
        metrics.bytes_delivered(100);
        metrics.bytes_delivered(28);

        let snap = metrics.snapshot();
        assert_eq!(snap.direct_dispatches, 2);
        assert_eq!(snap.queued_tasks, 1);
        assert_eq!(snap.bytes_delivered, 128);
        assert_eq!(snap.results_delivered, 0);
    }
}
