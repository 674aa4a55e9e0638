//! Cron-driven firing of periodic policies.
//!
//! Policies live in `{ns}:periodic:policies` and their next firing instant in
//! the `{ns}:periodic:index` sorted set. Only the node holding the
//! `{ns}:periodic:leader` lease fires; the others keep trying to take it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobservice_core::{Clock, CronSpec, JobId, JobKind, JobStats, JobStatus, Parameters};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Policy, SchedulerError};
use crate::kv::{KvStore, Keys, ZAddMode};
use crate::worker::{DispatchError, Dispatcher, NewJob};

/// Due policies handled per pass.
const FIRE_BATCH: usize = 100;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick: Duration,
    pub leader_ttl: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            leader_ttl: Duration::from_secs(30),
        }
    }
}

impl SchedulerOptions {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

pub struct PeriodicScheduler {
    kv: Arc<dyn KvStore>,
    keys: Keys,
    clock: Arc<dyn Clock>,
    dispatcher: Dispatcher,
    options: SchedulerOptions,
    node_id: String,
}

impl std::fmt::Debug for PeriodicScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicScheduler")
            .field("node_id", &self.node_id)
            .field("options", &self.options)
            .finish()
    }
}

impl PeriodicScheduler {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: Keys,
        clock: Arc<dyn Clock>,
        dispatcher: Dispatcher,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            kv,
            keys,
            clock,
            dispatcher,
            options,
            node_id: crate::instance_id(),
        }
    }

    /// Persist a policy and its parent job; returns the parent.
    ///
    /// The parent stays `Scheduled` for its whole life and never expires.
    pub async fn schedule(
        &self,
        name: &str,
        params: Parameters,
        cron: &CronSpec,
        is_unique: bool,
        hook: Option<String>,
    ) -> Result<JobStats, SchedulerError> {
        let now = self.clock.now();
        let id = JobId::generate();
        let policy = Policy {
            id: id.clone(),
            job_name: name.to_string(),
            cron_spec: cron.expr().to_string(),
            parameters: params,
            is_unique,
            status_hook: hook.filter(|u| !u.trim().is_empty()),
            created_at: now.timestamp(),
        };
        let next = policy.next_after(now)?;

        let mut parent = JobStats::new(id.clone(), name, JobKind::Periodic, now.timestamp());
        parent.status = JobStatus::Scheduled;
        parent.cron_spec = Some(policy.cron_spec.clone());
        parent.parameters = policy.parameters.clone();
        parent.is_unique = is_unique;
        parent.status_hook = policy.status_hook.clone();
        let mut tracker = self.dispatcher.lcm().new_tracker(parent);
        tracker.save().await?;

        let raw = serde_json::to_string(&policy)?;
        self.kv
            .hset(&self.keys.periodic_policies(), &[(id.to_string(), raw)])
            .await?;
        self.kv
            .zadd(&self.keys.periodic_index(), id.as_str(), next as f64, ZAddMode::Nx)
            .await?;
        info!(job_id = %id, job_name = %name, cron = %policy.cron_spec, next_fire_at = next, "periodic policy scheduled");
        Ok(tracker.job().clone())
    }

    /// Remove a policy and stop its executions that have not finished.
    /// Returns how many executions were asked to stop.
    pub async fn unschedule(&self, parent_id: &JobId) -> Result<usize, SchedulerError> {
        let tracker = self.dispatcher.lcm().track(parent_id).await?;
        let removed = self
            .kv
            .hdel(&self.keys.periodic_policies(), parent_id.as_str())
            .await?;
        self.kv
            .zrem(&self.keys.periodic_index(), parent_id.as_str())
            .await?;

        let mut stopped = 0;
        for execution in tracker.executions(true).await? {
            match self.dispatcher.request_stop(&execution).await {
                Ok(_) => stopped += 1,
                Err(e) => warn!(job_id = %execution, error = %e, "failed to stop periodic execution"),
            }
        }
        info!(job_id = %parent_id, policy_removed = removed, stopped, "periodic policy unscheduled");
        Ok(stopped)
    }

    pub async fn policy(&self, parent_id: &JobId) -> Result<Option<Policy>, SchedulerError> {
        let raw = self
            .kv
            .hget(&self.keys.periodic_policies(), parent_id.as_str())
            .await?;
        Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    pub async fn policies(&self) -> Result<Vec<Policy>, SchedulerError> {
        let raw = self.kv.hgetall(&self.keys.periodic_policies()).await?;
        let mut policies: Vec<Policy> = raw
            .into_iter()
            .filter_map(|(id, raw)| match serde_json::from_str(&raw) {
                Ok(policy) => Some(policy),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "ignoring malformed periodic policy");
                    None
                }
            })
            .collect();
        policies.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(policies)
    }

    /// Unix second of the policy's next firing, if it is indexed.
    pub async fn next_fire_at(&self, parent_id: &JobId) -> Result<Option<i64>, SchedulerError> {
        let score = self
            .kv
            .zscore(&self.keys.periodic_index(), parent_id.as_str())
            .await?;
        Ok(score.map(|s| s as i64))
    }

    /// Re-index stored policies missing from the index and drop index
    /// entries whose policy is gone. Returns the number of live policies.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let now = self.clock.now();
        let index = self.keys.periodic_index();
        let policies = self.policies().await?;
        let mut reindexed = 0;
        for policy in &policies {
            if self.kv.zscore(&index, policy.id.as_str()).await?.is_some() {
                continue;
            }
            match policy.next_after(now) {
                Ok(next) => {
                    self.kv
                        .zadd(&index, policy.id.as_str(), next as f64, ZAddMode::Nx)
                        .await?;
                    reindexed += 1;
                }
                Err(e) => warn!(job_id = %policy.id, error = %e, "cannot re-index periodic policy"),
            }
        }

        let indexed = self
            .kv
            .zrange_by_score(&index, f64::NEG_INFINITY, f64::INFINITY, 0, None)
            .await?;
        for (id, _) in indexed {
            if !policies.iter().any(|p| p.id.as_str() == id) {
                self.kv.zrem(&index, &id).await?;
                debug!(job_id = %id, "removed orphaned periodic index entry");
            }
        }
        if reindexed > 0 {
            info!(reindexed, "periodic policies recovered");
        }
        Ok(policies.len())
    }

    /// Launch one execution for every policy that is due. Returns the number
    /// of executions launched.
    pub async fn fire_due(&self) -> Result<usize, SchedulerError> {
        let now = self.clock.now();
        let index = self.keys.periodic_index();
        let due = self
            .kv
            .zrange_by_score(&index, f64::NEG_INFINITY, now.timestamp() as f64, 0, Some(FIRE_BATCH))
            .await?;

        let mut launched = 0;
        for (raw_id, score) in due {
            let Ok(parent_id) = raw_id.parse::<JobId>() else {
                self.kv.zrem(&index, &raw_id).await?;
                continue;
            };
            let Some(policy) = self.policy(&parent_id).await? else {
                self.kv.zrem(&index, &raw_id).await?;
                continue;
            };
            let cron = match policy.cron() {
                Ok(cron) => cron,
                Err(e) => {
                    warn!(job_id = %parent_id, error = %e, "dropping unusable periodic policy");
                    self.kv.zrem(&index, &raw_id).await?;
                    continue;
                }
            };

            let fire_at = score as i64;
            if self.fire(&policy, &cron, fire_at, now).await? {
                launched += 1;
            }
            match cron.next_after(now) {
                Some(next) => {
                    self.kv
                        .zadd(&index, &raw_id, next.timestamp() as f64, ZAddMode::Xx)
                        .await?;
                }
                None => {
                    self.kv.zrem(&index, &raw_id).await?;
                }
            }
        }
        Ok(launched)
    }

    async fn fire(
        &self,
        policy: &Policy,
        cron: &CronSpec,
        fire_at: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let Some(fire_instant) = DateTime::<Utc>::from_timestamp(fire_at, 0) else {
            return Ok(false);
        };
        let age = now - fire_instant;
        if let Some(period) = cron.period_at(fire_instant) {
            if age > period {
                warn!(
                    job_id = %policy.id,
                    fire_at,
                    age_secs = age.num_seconds(),
                    "stale periodic firing skipped"
                );
                return Ok(false);
            }
        }

        let execution = NewJob::new(policy.job_name.clone(), policy.parameters.clone())
            .unique(policy.is_unique)
            .hook(policy.status_hook.clone())
            .execution_of(policy.id.clone(), fire_at);
        match self.dispatcher.launch(execution).await {
            Ok(stats) => {
                info!(job_id = %policy.id, execution_id = %stats.id, fire_at, "periodic execution launched");
                Ok(true)
            }
            Err(DispatchError::Duplicate { .. }) => {
                info!(job_id = %policy.id, fire_at, "previous execution still active, firing skipped");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take or renew the leader lease.
    pub async fn try_lead(&self) -> Result<bool, SchedulerError> {
        let key = self.keys.periodic_leader();
        if self
            .kv
            .set_nx(&key, &self.node_id, Some(self.options.leader_ttl))
            .await?
        {
            info!(node_id = %self.node_id, "periodic scheduler leadership acquired");
            return Ok(true);
        }
        Ok(self
            .kv
            .expire_if_eq(&key, &self.node_id, self.options.leader_ttl)
            .await?)
    }

    async fn resign(&self) {
        match self
            .kv
            .del_if_eq(&self.keys.periodic_leader(), &self.node_id)
            .await
        {
            Ok(true) => info!(node_id = %self.node_id, "periodic scheduler leadership released"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to release scheduler leadership"),
        }
    }

    /// Run the firing loop until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.options.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut leading = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.try_lead().await {
                    Ok(true) => {}
                    Ok(false) => {
                        if leading {
                            warn!(node_id = %self.node_id, "periodic scheduler leadership lost");
                        }
                        leading = false;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "leader election failed");
                        leading = false;
                        continue;
                    }
                }
                leading = true;
                match self.fire_due().await {
                    Ok(0) => {}
                    Ok(n) => debug!(launched = n, "periodic executions launched"),
                    Err(e) => warn!(error = %e, "periodic firing pass failed"),
                }
            }
            if leading {
                self.resign().await;
            }
        })
    }
}
