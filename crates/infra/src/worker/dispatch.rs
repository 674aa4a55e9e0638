//! Launching and stopping jobs.
//!
//! Shared by the worker pool and the periodic scheduler so both create jobs
//! the same way: take the uniqueness lock, persist the stats record, and
//! only then make the id visible on a queue.

use std::sync::Arc;

use jobservice_core::{
    Clock, JobId, JobKind, JobStats, JobStatus, Parameters, ServiceError, params_hash,
};
use jobservice_jobs::OpCommand;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::kv::{KvError, KvStore, Keys, ZAddMode};
use crate::lcm::LifecycleController;
use crate::tracker::{STATS_TTL, TrackerError};

/// Field of the in-progress hash naming the pool running the job.
pub const IN_PROGRESS_POOL: &str = "pool_id";
pub const IN_PROGRESS_STARTED: &str = "started_at";
/// Field of the in-progress hash holding a pending [`OpCommand`].
pub const IN_PROGRESS_OP: &str = "op_command";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("a '{name}' job with the same parameters is already queued or running")]
    Duplicate { name: String },

    #[error(transparent)]
    Store(#[from] KvError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

impl From<DispatchError> for ServiceError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Duplicate { .. } => ServiceError::conflict(e.to_string()),
            DispatchError::Tracker(inner) => inner.into(),
            DispatchError::Store(inner) => ServiceError::internal("job queue failure").with_cause(inner),
        }
    }
}

/// Where a new job id goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Tail of the default queue.
    Default,
    /// Tail of the priority queue.
    Priority,
    /// Delayed set, due at the given Unix second.
    At(i64),
}

/// A job about to be created.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub parameters: Parameters,
    pub kind: JobKind,
    pub is_unique: bool,
    pub status_hook: Option<String>,
    pub upstream_job_id: Option<JobId>,
    pub run_at: Option<i64>,
    pub placement: Placement,
}

impl NewJob {
    pub fn new(name: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            name: name.into(),
            parameters,
            kind: JobKind::Generic,
            is_unique: false,
            status_hook: None,
            upstream_job_id: None,
            run_at: None,
            placement: Placement::Default,
        }
    }

    pub fn unique(mut self, is_unique: bool) -> Self {
        self.is_unique = is_unique;
        self
    }

    pub fn hook(mut self, url: Option<String>) -> Self {
        self.status_hook = url.filter(|u| !u.trim().is_empty());
        self
    }

    /// Delay until `run_at` and mark the job as scheduled.
    pub fn at(mut self, run_at: i64) -> Self {
        self.kind = JobKind::Scheduled;
        self.run_at = Some(run_at);
        self.placement = Placement::At(run_at);
        self
    }

    /// Execution of a periodic policy fired for `run_at`.
    pub fn execution_of(mut self, parent: JobId, run_at: i64) -> Self {
        self.kind = JobKind::Scheduled;
        self.upstream_job_id = Some(parent);
        self.run_at = Some(run_at);
        self.placement = Placement::Priority;
        self
    }
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The job had not started; it is `Stopped` now.
    Stopped,
    /// The job is running and will see the stop command.
    Signalled,
    /// Nothing to do, the job already finished.
    AlreadyFinished,
    /// A periodic policy was removed; its parent stays `Scheduled`.
    Unscheduled,
}

#[derive(Clone)]
pub struct Dispatcher {
    kv: Arc<dyn KvStore>,
    keys: Keys,
    clock: Arc<dyn Clock>,
    lcm: Arc<LifecycleController>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("namespace", &self.keys.namespace())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: Keys,
        clock: Arc<dyn Clock>,
        lcm: Arc<LifecycleController>,
    ) -> Self {
        Self {
            kv,
            keys,
            clock,
            lcm,
        }
    }

    pub fn lcm(&self) -> &Arc<LifecycleController> {
        &self.lcm
    }

    /// Create a job and queue it according to its placement.
    pub async fn launch(&self, job: NewJob) -> Result<JobStats, DispatchError> {
        let id = JobId::generate();
        let now = self.clock.unix();

        let lock = if job.is_unique {
            let key = self.keys.unique(&job.name, &params_hash(&job.name, &job.parameters));
            if !self.kv.set_nx(&key, id.as_str(), Some(STATS_TTL)).await? {
                debug!(job_name = %job.name, "unique job already present");
                return Err(DispatchError::Duplicate { name: job.name });
            }
            Some(key)
        } else {
            None
        };

        match self.persist_and_queue(id.clone(), now, job).await {
            Ok(stats) => Ok(stats),
            Err(e) => {
                if let Some(key) = lock {
                    if let Err(release) = self.kv.del_if_eq(&key, id.as_str()).await {
                        warn!(job_id = %id, error = %release, "failed to release uniqueness lock");
                    }
                }
                Err(e)
            }
        }
    }

    async fn persist_and_queue(&self, id: JobId, now: i64, job: NewJob) -> Result<JobStats, DispatchError> {
        let mut stats = JobStats::new(id, job.name, job.kind, now);
        stats.parameters = job.parameters;
        stats.is_unique = job.is_unique;
        stats.status_hook = job.status_hook;
        stats.upstream_job_id = job.upstream_job_id;
        stats.run_at = job.run_at;
        if matches!(job.placement, Placement::At(_)) {
            stats.status = JobStatus::Scheduled;
        }

        let mut tracker = self.lcm.new_tracker(stats);
        tracker.save().await?;
        let stats = tracker.job().clone();

        let id = stats.id.as_str();
        match job.placement {
            Placement::Default => {
                self.kv.rpush(&self.keys.queue_default(), id).await?;
            }
            Placement::Priority => {
                self.kv.rpush(&self.keys.queue_priority(), id).await?;
            }
            Placement::At(run_at) => {
                self.kv
                    .zadd(&self.keys.scheduled(), id, run_at as f64, ZAddMode::Always)
                    .await?;
            }
        }
        info!(
            job_id = %stats.id,
            job_name = %stats.name,
            kind = %stats.kind,
            status = %stats.status,
            "job launched"
        );
        Ok(stats)
    }

    /// Stop a non-periodic job.
    ///
    /// Jobs still waiting on a queue (or waiting for a retry) are removed
    /// and stopped directly; running jobs get a stop command.
    pub async fn request_stop(&self, job_id: &JobId) -> Result<StopOutcome, DispatchError> {
        let mut tracker = self.lcm.track(job_id).await?;
        if tracker.status().is_terminal() {
            return Ok(StopOutcome::AlreadyFinished);
        }

        let in_progress = self.keys.in_progress(job_id.as_str());
        self.kv
            .hset(
                &in_progress,
                &[(IN_PROGRESS_OP.to_string(), OpCommand::Stop.as_str().to_string())],
            )
            .await?;
        self.kv.expire(&in_progress, STATS_TTL).await?;

        let id = job_id.as_str();
        let waiting_retry = self.kv.zrem(&self.keys.scheduled(), id).await?;
        let stop_now = match tracker.status() {
            JobStatus::Pending | JobStatus::Scheduled => {
                self.kv.lrem(&self.keys.queue_default(), id).await?;
                self.kv.lrem(&self.keys.queue_priority(), id).await?;
                true
            }
            _ => waiting_retry,
        };
        if !stop_now {
            info!(job_id = %job_id, "stop command sent to running job");
            return Ok(StopOutcome::Signalled);
        }

        match tracker.update_status(JobStatus::Stopped, tracker.revision()).await {
            Ok(_) => {
                self.kv.del(&in_progress).await?;
                info!(job_id = %job_id, "job stopped before running");
                Ok(StopOutcome::Stopped)
            }
            // A worker picked it up meanwhile; it will see the command.
            Err(e) if e.is_conflict() => Ok(StopOutcome::Signalled),
            Err(e) => Err(e.into()),
        }
    }
}
