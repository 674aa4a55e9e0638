//! Infrastructure layer: the KV store, job lifecycle, hooks, workers and
//! the periodic scheduler.

pub mod hook;
pub mod kv;
pub mod lcm;
pub mod mgt;
pub mod period;
pub mod retry;
pub mod tracker;
pub mod worker;

pub use hook::{HookAgent, HookAgentOptions, HookClient, HookError, HookStats};
pub use kv::{InMemoryStore, KvError, KvStore, Keys};
#[cfg(feature = "redis")]
pub use kv::{RedisStore, RedisTimeouts};
pub use lcm::{LcmOptions, LifecycleController};
pub use mgt::StatsManager;
pub use period::{PeriodicScheduler, SchedulerError, SchedulerOptions};
pub use retry::RetryPolicy;
pub use tracker::{Tracker, TrackerError};
pub use worker::{PoolError, PoolOptions, StopOutcome, WorkerPool, WorkerPoolStats};

/// Random identifier for this process, used for leases and heartbeats.
pub fn instance_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}
