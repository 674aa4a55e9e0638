//! Read-side queries over stored job records.

use std::sync::Arc;

use jobservice_core::{JobCursorPage, JobId, JobKind, JobPage, JobStats, PageQuery};
use tracing::debug;

use crate::kv::{KvStore, Keys};
use crate::lcm::LifecycleController;
use crate::tracker::TrackerError;

/// Lookups used by the API. Results are eventually consistent with writes.
#[derive(Clone)]
pub struct StatsManager {
    kv: Arc<dyn KvStore>,
    keys: Keys,
    lcm: Arc<LifecycleController>,
}

impl std::fmt::Debug for StatsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsManager")
            .field("namespace", &self.keys.namespace())
            .finish()
    }
}

impl StatsManager {
    pub fn new(kv: Arc<dyn KvStore>, lcm: Arc<LifecycleController>) -> Self {
        let keys = lcm.keys().clone();
        Self { kv, keys, lcm }
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<JobStats, TrackerError> {
        Ok(self.lcm.track(job_id).await?.job().clone())
    }

    /// One step of a walk over every stored job.
    pub async fn get_jobs(&self, cursor: u64, page_size: usize) -> Result<JobCursorPage, TrackerError> {
        let (next_cursor, keys) = self
            .kv
            .scan(cursor, &self.keys.job_stats_pattern(), page_size.max(1))
            .await?;
        let ids: Vec<JobId> = keys
            .iter()
            .filter_map(|key| self.keys.job_id_from_stats_key(key))
            .filter_map(|id| id.parse().ok())
            .collect();
        Ok(JobCursorPage {
            jobs: self.load_all(&ids).await?,
            next_cursor,
        })
    }

    /// Executions of a periodic job, newest first.
    pub async fn get_periodic_executions(
        &self,
        parent_id: &JobId,
        query: &PageQuery,
    ) -> Result<JobPage, TrackerError> {
        let parent = self.lcm.track(parent_id).await?;
        if parent.job().kind != JobKind::Periodic {
            return Err(TrackerError::NotPeriodic(parent_id.clone()));
        }

        let key = self.keys.periodic_executions(parent_id.as_str());
        // Finished executions carry a negative score.
        let min = if query.non_stopped_only { 0.0 } else { f64::NEG_INFINITY };
        let total = self.kv.zcount(&key, min, f64::INFINITY).await?;
        let members = self
            .kv
            .zrevrange_by_score(&key, f64::INFINITY, min, query.offset(), Some(query.limit()))
            .await?;
        let ids: Vec<JobId> = members
            .into_iter()
            .filter_map(|(id, _)| id.parse().ok())
            .collect();
        Ok(JobPage {
            jobs: self.load_all(&ids).await?,
            total,
        })
    }

    /// Delayed jobs and pending retries, soonest first.
    pub async fn get_scheduled_jobs(&self, query: &PageQuery) -> Result<JobPage, TrackerError> {
        let key = self.keys.scheduled();
        let total = self.kv.zcard(&key).await?;
        let members = self
            .kv
            .zrange_by_score(
                &key,
                f64::NEG_INFINITY,
                f64::INFINITY,
                query.offset(),
                Some(query.limit()),
            )
            .await?;
        let ids: Vec<JobId> = members
            .into_iter()
            .filter_map(|(id, _)| id.parse().ok())
            .collect();
        Ok(JobPage {
            jobs: self.load_all(&ids).await?,
            total,
        })
    }

    async fn load_all(&self, ids: &[JobId]) -> Result<Vec<JobStats>, TrackerError> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.lcm.track(id).await {
                Ok(tracker) => jobs.push(tracker.job().clone()),
                // Expired or removed between the index read and the load.
                Err(TrackerError::NotFound(_)) => debug!(job_id = %id, "indexed job has no stats"),
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }
}
