use jobservice_core::{JobId, JobKind};
use serde::Serialize;
use tracing::{debug, warn};

use super::{LcmOptions, LifecycleController};
use crate::kv::{KvError, scan_all};
use crate::tracker::{EXECUTION_DONE_SCORE, STATS_TTL, StatusRetry, TrackerError};

const RETRY_BATCH: usize = 100;

/// What one reaper pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Stalled jobs moved to `Error`.
    pub stalled: u64,
    /// Open executions closed because they were too old.
    pub dangling_closed: u64,
    /// Index entries removed because their record is gone.
    pub dangling_removed: u64,
}

impl LifecycleController {
    pub(super) async fn reap(&self, options: &LcmOptions) -> Result<ReapReport, TrackerError> {
        let mut report = self.reap_stalled(options.max_update).await?;
        let dangling = self.sweep_dangling_executions(options.max_dangling).await?;
        report.dangling_closed = dangling.dangling_closed;
        report.dangling_removed = dangling.dangling_removed;
        Ok(report)
    }

    /// Fail non-terminal jobs not updated within `max_update`.
    ///
    /// Periodic parents stay `Scheduled` for their whole life and are skipped.
    pub async fn reap_stalled(&self, max_update: std::time::Duration) -> Result<ReapReport, TrackerError> {
        let mut report = ReapReport::default();
        let now = self.clock.unix();
        let cutoff = now - max_update.as_secs() as i64;

        for key in scan_all(self.kv.as_ref(), &self.keys.job_stats_pattern()).await? {
            let Some(id) = self.keys.job_id_from_stats_key(&key) else {
                continue;
            };
            let Ok(job_id) = id.parse::<JobId>() else {
                continue;
            };
            let mut tracker = match self.track(&job_id).await {
                Ok(tracker) => tracker,
                Err(TrackerError::NotFound(_)) => continue,
                Err(TrackerError::Decode(e)) => {
                    warn!(job_id = %job_id, error = %e, "skipping corrupt job record");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let job = tracker.job();
            if job.status.is_terminal() || job.kind == JobKind::Periodic {
                continue;
            }
            let last_seen = job.update_time.max(job.run_at.unwrap_or(0));
            if last_seen >= cutoff {
                continue;
            }

            let idle_hours = (now - last_seen) / 3600;
            let note = format!("stalled: no update for {idle_hours}h in status {}", job.status);
            if let Err(e) = tracker.check_in(&note).await {
                debug!(job_id = %job_id, error = %e, "stalled note not recorded");
            }
            if tracker.fail().await? {
                warn!(job_id = %job_id, idle_hours, "stalled job marked as error");
                report.stalled += 1;
            }
        }
        Ok(report)
    }

    /// Close or drop periodic execution index entries that outlived their job.
    pub async fn sweep_dangling_executions(
        &self,
        max_dangling: std::time::Duration,
    ) -> Result<ReapReport, TrackerError> {
        let mut report = ReapReport::default();
        let cutoff = (self.clock.unix() - max_dangling.as_secs() as i64) as f64;

        for key in scan_all(self.kv.as_ref(), &self.keys.periodic_executions_pattern()).await? {
            let Some(parent_id) = self.keys.parent_id_from_executions_key(&key) else {
                continue;
            };
            if !self.kv.exists(&self.keys.job_stats(parent_id)).await? {
                // Policy record gone; its index is useless.
                self.kv.del(&key).await?;
                report.dangling_removed += 1;
                continue;
            }

            let entries = self
                .kv
                .zrange_by_score(&key, f64::NEG_INFINITY, f64::INFINITY, 0, None)
                .await?;
            for (member, score) in entries {
                let Ok(job_id) = member.parse::<JobId>() else {
                    self.kv.zrem(&key, &member).await?;
                    report.dangling_removed += 1;
                    continue;
                };
                let mut tracker = match self.track(&job_id).await {
                    Ok(tracker) => tracker,
                    Err(TrackerError::NotFound(_)) => {
                        self.kv.zrem(&key, &member).await?;
                        report.dangling_removed += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if score == EXECUTION_DONE_SCORE || score >= cutoff {
                    continue;
                }
                if tracker.status().is_terminal() {
                    tracker.periodic_execution_done().await?;
                } else {
                    tracker.fail().await?;
                }
                report.dangling_closed += 1;
            }
        }
        Ok(report)
    }

    /// Re-apply terminal transitions that previously failed on a store error.
    /// Returns how many records were settled.
    pub async fn process_status_retries(&self) -> Result<usize, KvError> {
        let key = self.keys.status_update_retry();
        let oldest = (self.clock.unix() - STATS_TTL.as_secs() as i64) as f64;
        let pending = self
            .kv
            .zrange_by_score(&key, f64::NEG_INFINITY, f64::INFINITY, 0, Some(RETRY_BATCH))
            .await?;

        let mut settled = 0;
        for (member, score) in pending {
            let record = match serde_json::from_str::<StatusRetry>(&member) {
                Ok(record) if score >= oldest => record,
                Ok(_) | Err(_) => {
                    self.kv.zrem(&key, &member).await?;
                    settled += 1;
                    continue;
                }
            };
            let outcome = match self.track(&record.job_id).await {
                Ok(mut tracker) => tracker.transition(record.status).await,
                Err(e) => Err(e),
            };
            match outcome {
                Err(TrackerError::Store(e)) => {
                    debug!(job_id = %record.job_id, error = %e, "status update still failing");
                }
                Ok(_) | Err(_) => {
                    self.kv.zrem(&key, &member).await?;
                    settled += 1;
                }
            }
        }
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use jobservice_core::{Clock, JobStats, JobStatus, ManualClock};

    use super::*;
    use crate::kv::{InMemoryStore, KvStore, Keys, ZAddMode};

    fn setup() -> (Arc<InMemoryStore>, Arc<ManualClock>, LifecycleController) {
        let kv = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        let lcm = LifecycleController::new(kv.clone(), Keys::new("t"), clock.clone(), None);
        (kv, clock, lcm)
    }

    async fn job(lcm: &LifecycleController, kind: JobKind, status: JobStatus) -> JobId {
        let mut stats = JobStats::new(JobId::generate(), "SAMPLE", kind, lcm.clock().unix());
        stats.status = status;
        let mut tracker = lcm.new_tracker(stats);
        tracker.save().await.unwrap();
        tracker.job_id().clone()
    }

    #[tokio::test]
    async fn stalled_jobs_become_errors() {
        let (_kv, clock, lcm) = setup();
        let running = job(&lcm, JobKind::Generic, JobStatus::Running).await;
        let done = job(&lcm, JobKind::Generic, JobStatus::Success).await;
        let parent = job(&lcm, JobKind::Periodic, JobStatus::Scheduled).await;

        let report = lcm.reap_stalled(Duration::from_secs(24 * 3600)).await.unwrap();
        assert_eq!(report.stalled, 0);

        clock.advance(chrono::Duration::hours(25));
        let report = lcm.reap_stalled(Duration::from_secs(24 * 3600)).await.unwrap();
        assert_eq!(report.stalled, 1);

        let stalled = lcm.track(&running).await.unwrap();
        assert_eq!(stalled.status(), JobStatus::Error);
        assert!(stalled.job().check_in.as_deref().unwrap().starts_with("stalled"));
        assert_eq!(lcm.track(&done).await.unwrap().status(), JobStatus::Success);
        assert_eq!(lcm.track(&parent).await.unwrap().status(), JobStatus::Scheduled);
    }

    #[tokio::test]
    async fn future_run_at_is_not_stalled() {
        let (_kv, clock, lcm) = setup();
        let mut stats = JobStats::new(JobId::generate(), "SAMPLE", JobKind::Scheduled, clock.unix());
        stats.status = JobStatus::Scheduled;
        stats.run_at = Some(clock.unix() + 48 * 3600);
        lcm.new_tracker(stats).save().await.unwrap();

        clock.advance(chrono::Duration::hours(30));
        let report = lcm.reap_stalled(Duration::from_secs(24 * 3600)).await.unwrap();
        assert_eq!(report.stalled, 0);
    }

    #[tokio::test]
    async fn dangling_executions_are_closed_or_removed() {
        let (kv, clock, lcm) = setup();
        let keys = Keys::new("t");
        let parent = job(&lcm, JobKind::Periodic, JobStatus::Scheduled).await;

        let mut child = JobStats::new(JobId::generate(), "SAMPLE", JobKind::Scheduled, clock.unix());
        child.status = JobStatus::Running;
        child.upstream_job_id = Some(parent.clone());
        child.run_at = Some(clock.unix());
        let child_id = child.id.clone();
        lcm.new_tracker(child).save().await.unwrap();

        let index = keys.periodic_executions(parent.as_str());
        kv.zadd(&index, &JobId::generate().to_string(), clock.unix() as f64, ZAddMode::Always)
            .await
            .unwrap();
        kv.zadd(&keys.periodic_executions("gone"), "x", 1.0, ZAddMode::Always)
            .await
            .unwrap();

        clock.advance(chrono::Duration::hours(169));
        let report = lcm
            .sweep_dangling_executions(Duration::from_secs(168 * 3600))
            .await
            .unwrap();
        assert_eq!(report.dangling_closed, 1);
        assert_eq!(report.dangling_removed, 2);
        assert_eq!(lcm.track(&child_id).await.unwrap().status(), JobStatus::Error);
        assert_eq!(kv.zscore(&index, child_id.as_str()).await.unwrap(), Some(EXECUTION_DONE_SCORE));
        assert!(!kv.exists(&keys.periodic_executions("gone")).await.unwrap());
    }

    #[tokio::test]
    async fn queued_status_retries_are_applied_once() {
        let (kv, clock, lcm) = setup();
        let id = job(&lcm, JobKind::Generic, JobStatus::Running).await;
        let record = serde_json::to_string(&StatusRetry {
            job_id: id.clone(),
            status: JobStatus::Success,
        })
        .unwrap();
        let key = Keys::new("t").status_update_retry();
        kv.zadd(&key, &record, clock.unix() as f64, ZAddMode::Nx).await.unwrap();
        kv.zadd(&key, "not json", clock.unix() as f64, ZAddMode::Nx).await.unwrap();

        assert_eq!(lcm.process_status_retries().await.unwrap(), 2);
        assert_eq!(lcm.track(&id).await.unwrap().status(), JobStatus::Success);
        assert_eq!(kv.zcard(&key).await.unwrap(), 0);
    }
}
