use async_trait::async_trait;
use jobservice_core::Parameters;
use thiserror::Error;

use crate::context::JobContext;

/// How a handler run ended when it did not succeed.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The job observed a stop command and gave up on purpose.
    #[error("job stopped")]
    Stopped,

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Context(#[from] crate::context::ContextError),

    #[error(transparent)]
    Params(#[from] ParamError),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// A parameter failed validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("missing parameter '{0}'")]
    Missing(String),

    #[error("invalid parameter '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

impl ParamError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// A unit of asynchronous work registered under a job name.
///
/// A fresh instance is created for every execution, so handlers may keep
/// per-run state in `self`.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Failed attempts tolerated before the job ends in `Error`.
    fn max_fails(&self) -> u32;

    /// Whether failed runs are retried at all.
    fn should_retry(&self) -> bool;

    /// Reject parameters before the job is accepted.
    fn validate(&self, params: &Parameters) -> Result<(), ParamError>;

    /// Execute the job.
    ///
    /// Cooperative handlers poll [`JobContext::op_command`] and return
    /// [`HandlerError::Stopped`] once asked to stop.
    async fn run(&self, ctx: &dyn JobContext, params: &Parameters) -> Result<(), HandlerError>;
}
