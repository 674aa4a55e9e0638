//! Per-job stats tracker.
//!
//! A [`Tracker`] caches one job record and writes through to the KV store.
//! Every status change and check-in is a compare-and-set on the record's
//! `revision`, and the status order is checked here and nowhere else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobservice_core::stats::field;
use jobservice_core::{
    Clock, JobId, JobKind, JobStats, JobStatus, ServiceError, StatsDecodeError, StatusChange,
    params_hash,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::hook::HookError;
use crate::kv::{CasOutcome, KvError, KvStore, Keys, ZAddMode};

/// Stats records live this long after their last save.
pub const STATS_TTL: Duration = Duration::from_secs(180 * 24 * 3600);

/// Upper bound of the random extra TTL spreading expirations out.
const TTL_JITTER_SECS: u64 = 3600;

/// Score of a finished periodic execution in its parent's index.
pub const EXECUTION_DONE_SCORE: f64 = -1.0;

const MAX_CAS_ATTEMPTS: usize = 8;

/// Receives status changes of jobs that carry a status hook.
#[async_trait]
pub trait StatusHook: Send + Sync {
    async fn on_status_change(&self, url: &str, change: StatusChange) -> Result<(), HookError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusConflict {
    /// The target does not come after the current status.
    Status { current: JobStatus, target: JobStatus },
    /// The record moved on since the caller read it.
    Revision { expected: u64, actual: u64 },
}

impl std::fmt::Display for StatusConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status { current, target } => {
                write!(f, "cannot move from {current} to {target}")
            }
            Self::Revision { expected, actual } => {
                write!(f, "expected revision {expected}, found {actual}")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("job '{0}' not found")]
    NotFound(JobId),

    #[error("status conflict: {0}")]
    Conflict(StatusConflict),

    #[error(transparent)]
    Store(#[from] KvError),

    #[error("corrupt job record: {0}")]
    Decode(#[from] StatsDecodeError),

    #[error("job '{0}' is not a periodic job")]
    NotPeriodic(JobId),

    #[error("job '{0}' is not a periodic execution")]
    NotPeriodicExecution(JobId),

    #[error("check in message is empty")]
    EmptyCheckIn,
}

impl TrackerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<TrackerError> for ServiceError {
    fn from(e: TrackerError) -> Self {
        match &e {
            TrackerError::NotFound(_) => ServiceError::not_found(e.to_string()),
            TrackerError::Conflict(_) => ServiceError::conflict(e.to_string()),
            TrackerError::EmptyCheckIn
            | TrackerError::NotPeriodic(_)
            | TrackerError::NotPeriodicExecution(_) => ServiceError::bad_request(e.to_string()),
            TrackerError::Store(_) | TrackerError::Decode(_) => {
                ServiceError::internal("job stats store failure").with_cause(&e)
            }
        }
    }
}

/// A terminal transition waiting to be re-applied after a store failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRetry {
    pub job_id: JobId,
    pub status: JobStatus,
}

pub struct Tracker {
    kv: Arc<dyn KvStore>,
    keys: Keys,
    clock: Arc<dyn Clock>,
    stats: JobStats,
    hook: Option<Arc<dyn StatusHook>>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("job_id", &self.stats.id)
            .field("status", &self.stats.status)
            .field("revision", &self.stats.revision)
            .finish()
    }
}

impl Tracker {
    /// Wrap a record that has not been saved yet.
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: Keys,
        clock: Arc<dyn Clock>,
        stats: JobStats,
        hook: Option<Arc<dyn StatusHook>>,
    ) -> Self {
        Self {
            kv,
            keys,
            clock,
            stats,
            hook,
        }
    }

    /// Read an existing record.
    pub async fn load(
        kv: Arc<dyn KvStore>,
        keys: Keys,
        clock: Arc<dyn Clock>,
        job_id: &JobId,
        hook: Option<Arc<dyn StatusHook>>,
    ) -> Result<Self, TrackerError> {
        let stats = fetch(kv.as_ref(), &keys, job_id).await?;
        Ok(Self::new(kv, keys, clock, stats, hook))
    }

    pub fn job(&self) -> &JobStats {
        &self.stats
    }

    pub fn job_id(&self) -> &JobId {
        &self.stats.id
    }

    pub fn status(&self) -> JobStatus {
        self.stats.status
    }

    pub fn revision(&self) -> u64 {
        self.stats.revision
    }

    /// Refresh the cached record from the store.
    pub async fn reload(&mut self) -> Result<&JobStats, TrackerError> {
        self.stats = fetch(self.kv.as_ref(), &self.keys, &self.stats.id).await?;
        Ok(&self.stats)
    }

    /// Write the whole record and index it under its periodic parent.
    pub async fn save(&mut self) -> Result<(), TrackerError> {
        let key = self.keys.job_stats(self.stats.id.as_str());
        self.kv.hset(&key, &self.stats.to_fields()).await?;
        if let Some(ttl) = self.ttl() {
            self.kv.expire(&key, ttl).await?;
        }
        if let Some(parent) = &self.stats.upstream_job_id {
            let score = self.stats.run_at.unwrap_or(self.stats.enqueue_time) as f64;
            self.kv
                .zadd(
                    &self.keys.periodic_executions(parent.as_str()),
                    self.stats.id.as_str(),
                    score,
                    ZAddMode::Nx,
                )
                .await?;
        }
        debug!(job_id = %self.stats.id, status = %self.stats.status, "saved job stats");
        Ok(())
    }

    fn ttl(&self) -> Option<Duration> {
        if self.stats.kind == JobKind::Periodic {
            return None;
        }
        let delay = self
            .stats
            .run_at
            .map(|run_at| (run_at - self.clock.unix()).max(0) as u64)
            .unwrap_or(0);
        let jitter = rand::thread_rng().gen_range(0..TTL_JITTER_SECS);
        Some(STATS_TTL + Duration::from_secs(delay + jitter))
    }

    /// Move to `target` if it comes after the current status and the record
    /// is still at `expected_revision`. Returns the new revision.
    pub async fn update_status(
        &mut self,
        target: JobStatus,
        expected_revision: u64,
    ) -> Result<u64, TrackerError> {
        if expected_revision != self.stats.revision {
            self.reload().await?;
        }
        let current = self.stats.status;
        if !current.can_transition_to(target) {
            return Err(TrackerError::Conflict(StatusConflict::Status { current, target }));
        }

        let now = self.clock.unix();
        let fields = vec![
            (field::STATUS.to_string(), target.to_string()),
            (field::UPDATE_TIME.to_string(), now.to_string()),
        ];
        let revision = self.cas(expected_revision, &fields).await?;
        self.stats.status = target;
        self.stats.update_time = now;
        self.stats.revision = revision;
        info!(
            job_id = %self.stats.id,
            job_name = %self.stats.name,
            status = %target,
            revision,
            "job status changed"
        );

        if target.is_terminal() {
            self.on_terminal().await;
        }
        let change = StatusChange {
            job_id: self.stats.id.clone(),
            status: target,
            check_in: None,
            metadata: Some(self.stats.clone()),
            revision,
        };
        self.notify(change).await;
        Ok(revision)
    }

    /// Move to `target`, re-reading the record on revision races.
    ///
    /// Returns `false` when the current status already is `target` or a later
    /// one. A store failure on a terminal transition is queued for retry.
    pub async fn transition(&mut self, target: JobStatus) -> Result<bool, TrackerError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            match self.update_status(target, self.stats.revision).await {
                Ok(_) => return Ok(true),
                Err(TrackerError::Conflict(StatusConflict::Status { current, .. })) => {
                    debug!(job_id = %self.stats.id, %current, %target, "transition ignored");
                    return Ok(false);
                }
                Err(TrackerError::Conflict(StatusConflict::Revision { .. })) => {
                    self.reload().await?;
                }
                Err(TrackerError::Store(e)) if target.is_terminal() => {
                    self.queue_status_retry(target).await;
                    return Err(TrackerError::Store(e));
                }
                Err(e) => return Err(e),
            }
        }
        Err(TrackerError::Conflict(StatusConflict::Revision {
            expected: self.stats.revision,
            actual: self.stats.revision,
        }))
    }

    pub async fn run(&mut self) -> Result<bool, TrackerError> {
        self.transition(JobStatus::Running).await
    }

    pub async fn succeed(&mut self) -> Result<bool, TrackerError> {
        self.transition(JobStatus::Success).await
    }

    pub async fn fail(&mut self) -> Result<bool, TrackerError> {
        self.transition(JobStatus::Error).await
    }

    pub async fn stop(&mut self) -> Result<bool, TrackerError> {
        self.transition(JobStatus::Stopped).await
    }

    /// Publish a progress message. Ignored once the job is terminal.
    pub async fn check_in(&mut self, message: &str) -> Result<bool, TrackerError> {
        if message.trim().is_empty() {
            return Err(TrackerError::EmptyCheckIn);
        }
        for _ in 0..MAX_CAS_ATTEMPTS {
            if self.stats.status.is_terminal() {
                return Ok(false);
            }
            let now = self.clock.unix();
            let fields = vec![
                (field::CHECK_IN.to_string(), message.to_string()),
                (field::CHECK_IN_AT.to_string(), now.to_string()),
                (field::UPDATE_TIME.to_string(), now.to_string()),
            ];
            match self.cas(self.stats.revision, &fields).await {
                Ok(revision) => {
                    self.stats.check_in = Some(message.to_string());
                    self.stats.check_in_at = Some(now);
                    self.stats.update_time = now;
                    self.stats.revision = revision;
                    let change = StatusChange {
                        job_id: self.stats.id.clone(),
                        status: self.stats.status,
                        check_in: Some(message.to_string()),
                        metadata: None,
                        revision,
                    };
                    self.notify(change).await;
                    return Ok(true);
                }
                Err(TrackerError::Conflict(_)) => {
                    self.reload().await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Count one more failed attempt and push the next run to `run_at`.
    /// The status is left as is.
    pub async fn record_failure(&mut self, run_at: i64) -> Result<u32, TrackerError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let fails = self.stats.fails + 1;
            let now = self.clock.unix();
            let fields = vec![
                (field::FAILS.to_string(), fails.to_string()),
                (field::RUN_AT.to_string(), run_at.to_string()),
                (field::UPDATE_TIME.to_string(), now.to_string()),
            ];
            match self.cas(self.stats.revision, &fields).await {
                Ok(revision) => {
                    self.stats.fails = fails;
                    self.stats.run_at = Some(run_at);
                    self.stats.update_time = now;
                    self.stats.revision = revision;
                    return Ok(fails);
                }
                Err(TrackerError::Conflict(_)) => {
                    self.reload().await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(TrackerError::Conflict(StatusConflict::Revision {
            expected: self.stats.revision,
            actual: self.stats.revision,
        }))
    }

    /// Ids of a periodic parent's executions, newest first.
    pub async fn executions(&self, open_only: bool) -> Result<Vec<JobId>, TrackerError> {
        if self.stats.kind != JobKind::Periodic {
            return Err(TrackerError::NotPeriodic(self.stats.id.clone()));
        }
        let min = if open_only { 0.0 } else { f64::NEG_INFINITY };
        let members = self
            .kv
            .zrevrange_by_score(
                &self.keys.periodic_executions(self.stats.id.as_str()),
                f64::INFINITY,
                min,
                0,
                None,
            )
            .await?;
        Ok(members
            .into_iter()
            .filter_map(|(member, _)| member.parse().ok())
            .collect())
    }

    /// Mark this execution finished in its parent's index.
    pub async fn periodic_execution_done(&self) -> Result<(), TrackerError> {
        let Some(parent) = &self.stats.upstream_job_id else {
            return Err(TrackerError::NotPeriodicExecution(self.stats.id.clone()));
        };
        self.kv
            .zadd(
                &self.keys.periodic_executions(parent.as_str()),
                self.stats.id.as_str(),
                EXECUTION_DONE_SCORE,
                ZAddMode::Xx,
            )
            .await?;
        Ok(())
    }

    async fn cas(&self, expected: u64, fields: &[(String, String)]) -> Result<u64, TrackerError> {
        let key = self.keys.job_stats(self.stats.id.as_str());
        match self.kv.hcas(&key, field::REVISION, expected, fields).await? {
            CasOutcome::Applied(revision) => Ok(revision),
            CasOutcome::VersionMismatch(actual) => {
                Err(TrackerError::Conflict(StatusConflict::Revision { expected, actual }))
            }
            CasOutcome::Missing => Err(TrackerError::NotFound(self.stats.id.clone())),
        }
    }

    async fn on_terminal(&self) {
        if self.stats.is_unique {
            let hash = params_hash(&self.stats.name, &self.stats.parameters);
            let key = self.keys.unique(&self.stats.name, &hash);
            if let Err(e) = self.kv.del_if_eq(&key, self.stats.id.as_str()).await {
                warn!(job_id = %self.stats.id, error = %e, "failed to release uniqueness lock");
            }
        }
        if self.stats.upstream_job_id.is_some() {
            if let Err(e) = self.periodic_execution_done().await {
                warn!(job_id = %self.stats.id, error = %e, "failed to close periodic execution");
            }
        }
    }

    async fn notify(&self, change: StatusChange) {
        let (Some(hook), Some(url)) = (&self.hook, self.stats.hook_url()) else {
            return;
        };
        if let Err(e) = hook.on_status_change(url, change).await {
            warn!(job_id = %self.stats.id, url, error = %e, "failed to queue status hook");
        }
    }

    async fn queue_status_retry(&self, status: JobStatus) {
        let record = StatusRetry {
            job_id: self.stats.id.clone(),
            status,
        };
        let member = match serde_json::to_string(&record) {
            Ok(member) => member,
            Err(e) => {
                warn!(job_id = %self.stats.id, error = %e, "failed to encode status retry");
                return;
            }
        };
        let key = self.keys.status_update_retry();
        match self
            .kv
            .zadd(&key, &member, self.clock.unix() as f64, ZAddMode::Nx)
            .await
        {
            Ok(()) => warn!(job_id = %self.stats.id, %status, "status update queued for retry"),
            Err(e) => warn!(job_id = %self.stats.id, %status, error = %e, "status update lost"),
        }
    }
}

async fn fetch(kv: &dyn KvStore, keys: &Keys, job_id: &JobId) -> Result<JobStats, TrackerError> {
    let fields = kv.hgetall(&keys.job_stats(job_id.as_str())).await?;
    if fields.is_empty() {
        return Err(TrackerError::NotFound(job_id.clone()));
    }
    Ok(JobStats::from_fields(&fields)?)
}
