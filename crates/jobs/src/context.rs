use async_trait::async_trait;
use jobservice_core::{JobId, Parameters};
use jobservice_observability::JobLogger;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::handler::ParamError;

/// Commands an operator can send to a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCommand {
    Stop,
}

impl OpCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("check in rejected: {0}")]
    CheckIn(String),
}

/// What a running handler can see and do.
#[async_trait]
pub trait JobContext: Send + Sync {
    fn job_id(&self) -> &JobId;

    /// Cancelled when the service shuts down.
    fn system_cancellation(&self) -> &CancellationToken;

    /// Publish a progress message on the job record (and its hook).
    async fn check_in(&self, message: &str) -> Result<(), ContextError>;

    /// A pending operator command, if any.
    async fn op_command(&self) -> Option<OpCommand>;

    fn logger(&self) -> &JobLogger;

    fn params(&self) -> Params<'_>;
}

/// Typed read access over job parameters.
#[derive(Debug, Clone, Copy)]
pub struct Params<'a> {
    inner: &'a Parameters,
}

impl<'a> Params<'a> {
    pub fn new(inner: &'a Parameters) -> Self {
        Self { inner }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn str(&self, key: &str) -> Result<Option<&'a str>, ParamError> {
        match self.inner.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(ParamError::invalid(key, "expected a string")),
        }
    }

    pub fn u64(&self, key: &str) -> Result<Option<u64>, ParamError> {
        match self.inner.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| ParamError::invalid(key, "expected a non-negative integer")),
        }
    }

    pub fn bool(&self, key: &str) -> Result<Option<bool>, ParamError> {
        match self.inner.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| ParamError::invalid(key, "expected a boolean")),
        }
    }

    /// Deserialize one parameter into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ParamError> {
        self.inner
            .get(key)
            .map(|v| serde_json::from_value(v.clone()).map_err(|e| ParamError::invalid(key, e.to_string())))
            .transpose()
    }

    pub fn required_str(&self, key: &str) -> Result<&'a str, ParamError> {
        self.str(key)?.ok_or_else(|| ParamError::Missing(key.to_string()))
    }
}
