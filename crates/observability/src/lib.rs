//! Tracing, per-job logging and job log retrieval.

pub mod job_logger;
pub mod retriever;
pub mod sweeper;
/// Process-wide tracing subscriber set up from logger configs.
pub mod tracing;

pub use job_logger::JobLogger;
pub use retriever::{FileLogRetriever, LogError, LogRetriever};
pub use sweeper::spawn_sweeper;
pub use tracing::{ObservabilityError, init, init_default};

/// Job loggers write `{base_dir}/{job_id}.log`.
pub const JOB_LOG_EXTENSION: &str = "log";

/// Default directory for job log files when a FILE job logger has no `base_dir`.
pub const DEFAULT_JOB_LOG_DIR: &str = "/var/log/jobs";
