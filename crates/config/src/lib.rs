//! `jobservice-config`: configuration of the job service.
//!
//! The YAML file is the base layer, the `JOB_SERVICE_*` environment variables
//! override it, and [`validate`] rejects the conditions that must abort startup.

pub mod load;
pub mod model;

use thiserror::Error;

pub use load::{apply_env, core_secret, from_yaml, load, validate};
pub use model::{
    Configuration, HookAgentConfig, HttpsConfig, LogLevel, LoggerConfig, LoggerSink, MetricConfig,
    Protocol, ReaperConfig, RedisPoolConfig, SweeperConfig, WorkerPoolConfig,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
