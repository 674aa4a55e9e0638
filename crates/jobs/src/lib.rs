//! `jobservice-jobs`: job handler contract and the registry of job types.
//!
//! The crate stays runtime-agnostic: the worker pool (infra) owns dequeueing,
//! status transitions and retries, and hands each handler a [`JobContext`].

pub mod context;
pub mod handler;
pub mod registry;
pub mod sample;

pub use context::{ContextError, JobContext, OpCommand, Params};
pub use handler::{HandlerError, JobHandler, ParamError};
pub use registry::{JobDescriptor, JobRegistry, JobRegistryBuilder, RegistryError};
pub use sample::{SAMPLE_JOB, SampleJob};
