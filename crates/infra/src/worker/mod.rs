//! Worker pool: queues, execution, retries, stop commands and heartbeats.

use jobservice_core::{JobId, ServiceError};
use jobservice_jobs::ParamError;
use thiserror::Error;

use crate::kv::KvError;
use crate::period::SchedulerError;
use crate::tracker::TrackerError;

pub mod context;
pub mod dispatch;
pub mod pool;
pub mod stats;

pub use context::WorkerJobContext;
pub use dispatch::{DispatchError, Dispatcher, NewJob, Placement, StopOutcome};
pub use pool::{PoolOptions, WorkerPool};
pub use stats::{CounterSnapshot, Heartbeat, PoolHealth, PoolStatus, WorkerPoolStats};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("job '{0}' not found")]
    NotFound(JobId),

    #[error("unknown job name '{0}'")]
    UnknownJob(String),

    #[error("invalid job parameters: {0}")]
    Params(#[from] ParamError),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Tracker(TrackerError),

    #[error(transparent)]
    Store(#[from] KvError),

    #[error("encode heartbeat: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<TrackerError> for PoolError {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::NotFound(id) => Self::NotFound(id),
            other => Self::Tracker(other),
        }
    }
}

impl From<PoolError> for ServiceError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::NotFound(_) => ServiceError::not_found(e.to_string()),
            PoolError::UnknownJob(_) | PoolError::Params(_) | PoolError::InvalidArgument(_) => {
                ServiceError::bad_request(e.to_string())
            }
            PoolError::InvalidState(_) => ServiceError::conflict(e.to_string()),
            PoolError::Dispatch(inner) => inner.into(),
            PoolError::Scheduler(inner) => inner.into(),
            PoolError::Tracker(inner) => inner.into(),
            PoolError::Store(_) | PoolError::Encode(_) => {
                ServiceError::internal("worker pool failure").with_cause(e)
            }
        }
    }
}
