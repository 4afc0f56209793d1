use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide propagation counters.
#[derive(Debug, Default)]
pub struct FanoutMetrics {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    stale: AtomicU64,
    abandoned: AtomicU64,
    replayed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub dispatched: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub stale: u64,
    pub abandoned: u64,
    pub replayed: u64,
}

impl FanoutMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn dispatched(&self, tasks: u64) {
        self.dispatched.fetch_add(tasks, Ordering::Relaxed);
    }

    pub(crate) fn succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn replayed(&self) {
        self.replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
        }
    }
}
