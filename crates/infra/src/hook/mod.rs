//! Status hook delivery.

use jobservice_core::ServiceError;
use thiserror::Error;

use crate::kv::KvError;

pub mod agent;
pub mod client;

pub use agent::{HookAgent, HookAgentOptions, HookStats, shard_for};
pub use client::{DELIVERY_TIMEOUT, Delivery, HookClient, HookSender, classify};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook url is empty")]
    EmptyUrl,

    #[error("encode hook event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] KvError),

    #[error("build hook client: {0}")]
    Client(String),
}

impl From<HookError> for ServiceError {
    fn from(e: HookError) -> Self {
        match e {
            HookError::EmptyUrl => ServiceError::bad_request(e.to_string()),
            other => ServiceError::internal("hook delivery failure").with_cause(other),
        }
    }
}
