//! `jobservice-core`: the job domain model.
//!
//! Pure types shared by every other crate: identifiers, kinds and statuses,
//! submission requests, persisted job records, hook events and the error
//! model. No I/O lives here.

pub mod clock;
pub mod cron;
pub mod error;
pub mod id;
pub mod params;
pub mod query;
pub mod request;
pub mod stats;
pub mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cron::CronSpec;
pub use error::{ErrorKind, ServiceError, ServiceResult};
pub use id::JobId;
pub use params::{Parameters, params_hash};
pub use query::{JobCursorPage, JobPage, PageQuery};
pub use request::{JobMetadata, JobRequest, Launch};
pub use stats::{HookEvent, HookPayload, JobStats, StatsDecodeError, StatusChange};
pub use status::{JobKind, JobStatus};
