//! Periodic policies and the leader-elected firing loop.

use jobservice_core::ServiceError;
use thiserror::Error;

use crate::kv::KvError;
use crate::tracker::TrackerError;
use crate::worker::DispatchError;

mod policy;
mod scheduler;

pub use policy::Policy;
pub use scheduler::{PeriodicScheduler, SchedulerOptions};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error(transparent)]
    Store(#[from] KvError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("encode policy: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<SchedulerError> for ServiceError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::InvalidCron { .. } => ServiceError::bad_request(e.to_string()),
            SchedulerError::Tracker(inner) => inner.into(),
            SchedulerError::Dispatch(inner) => inner.into(),
            SchedulerError::Store(_) | SchedulerError::Encode(_) => {
                ServiceError::internal("periodic scheduler failure").with_cause(e)
            }
        }
    }
}
