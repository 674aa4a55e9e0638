//! Pool heartbeats and execution counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A heartbeat older than this marks its pool as dead.
pub const DEAD_AFTER_SECS: i64 = 10;

/// Record each pool writes into `{ns}:workers` under its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pool_id: String,
    pub started_at: i64,
    pub heartbeat_at: i64,
    pub job_names: Vec<String>,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolHealth {
    Healthy,
    Dead,
}

impl Heartbeat {
    pub fn health_at(&self, now: i64) -> PoolHealth {
        if now - self.heartbeat_at > DEAD_AFTER_SECS {
            PoolHealth::Dead
        } else {
            PoolHealth::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    #[serde(flatten)]
    pub heartbeat: Heartbeat,
    pub status: PoolHealth,
}

/// Executions handled by this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub stopped: u64,
    pub running: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerPoolStats {
    pub pools: Vec<PoolStatus>,
    pub counters: CounterSnapshot,
}

#[derive(Debug, Default)]
pub struct PoolCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    stopped: AtomicU64,
    running: AtomicI64,
}

impl PoolCounters {
    pub fn started(&self) -> RunningGuard<'_> {
        self.running.fetch_add(1, Ordering::Relaxed);
        RunningGuard { counters: self }
    }

    pub fn succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stopped(&self) {
        self.stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            stopped: self.stopped.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }
}

/// Counts one execution as running until dropped.
pub struct RunningGuard<'a> {
    counters: &'a PoolCounters,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.counters.running.fetch_sub(1, Ordering::Relaxed);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_goes_dead_after_ten_seconds() {
        let hb = Heartbeat {
            pool_id: "p".into(),
            started_at: 100,
            heartbeat_at: 200,
            job_names: vec!["SAMPLE".into()],
            concurrency: 2,
        };
        assert_eq!(hb.health_at(210), PoolHealth::Healthy);
        assert_eq!(hb.health_at(211), PoolHealth::Dead);
    }

    #[test]
    fn running_guard_counts_processed_on_drop() {
        let counters = PoolCounters::default();
        {
            let _guard = counters.started();
            assert_eq!(counters.snapshot().running, 1);
        }
        counters.succeeded();
        let snap = counters.snapshot();
        assert_eq!(snap.running, 0);
        assert_eq!(snap.processed, 1);
        assert_eq!(snap.succeeded, 1);
    }
}
