//! Lifecycle controller.
//!
//! Every status change goes through a [`Tracker`] handed out here, so the
//! hook callback is wired in one place. The controller also runs the reaper
//! and the status-update retry loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobservice_config::ReaperConfig;
use jobservice_core::{Clock, HookEvent, JobId, JobStats, StatusChange};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hook::{HookAgent, HookError};
use crate::kv::{KvStore, Keys};
use crate::tracker::{StatusHook, Tracker, TrackerError};

mod reaper;

pub use reaper::ReapReport;

#[derive(Debug, Clone)]
pub struct LcmOptions {
    /// Non-terminal jobs untouched this long are failed.
    pub max_update: Duration,
    /// Open periodic executions older than this are closed.
    pub max_dangling: Duration,
    pub reaper_initial_delay: Duration,
    pub reaper_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for LcmOptions {
    fn default() -> Self {
        Self {
            max_update: Duration::from_secs(24 * 3600),
            max_dangling: Duration::from_secs(168 * 3600),
            reaper_initial_delay: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(3600),
            retry_interval: Duration::from_secs(10),
        }
    }
}

impl LcmOptions {
    pub fn from_config(reaper: &ReaperConfig) -> Self {
        Self {
            max_update: Duration::from_secs(reaper.max_update_hours * 3600),
            max_dangling: Duration::from_secs(reaper.max_dangling_hours * 3600),
            ..Default::default()
        }
    }
}

/// Turns tracker notifications into queued hook events.
pub struct HookForwarder {
    agent: Arc<HookAgent>,
    clock: Arc<dyn Clock>,
}

impl HookForwarder {
    pub fn new(agent: Arc<HookAgent>, clock: Arc<dyn Clock>) -> Self {
        Self { agent, clock }
    }
}

#[async_trait]
impl StatusHook for HookForwarder {
    async fn on_status_change(&self, url: &str, change: StatusChange) -> Result<(), HookError> {
        if url.trim().is_empty() {
            return Ok(());
        }
        let event = HookEvent::new(url, change, self.clock.unix(), self.agent.max_retries());
        self.agent.trigger(event).await
    }
}

pub struct LifecycleController {
    kv: Arc<dyn KvStore>,
    keys: Keys,
    clock: Arc<dyn Clock>,
    hook: Option<Arc<dyn StatusHook>>,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("namespace", &self.keys.namespace())
            .field("hooks", &self.hook.is_some())
            .finish()
    }
}

impl LifecycleController {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: Keys,
        clock: Arc<dyn Clock>,
        agent: Option<Arc<HookAgent>>,
    ) -> Self {
        let hook = agent.map(|agent| {
            Arc::new(HookForwarder::new(agent, clock.clone())) as Arc<dyn StatusHook>
        });
        Self::with_hook(kv, keys, clock, hook)
    }

    pub fn with_hook(
        kv: Arc<dyn KvStore>,
        keys: Keys,
        clock: Arc<dyn Clock>,
        hook: Option<Arc<dyn StatusHook>>,
    ) -> Self {
        Self {
            kv,
            keys,
            clock,
            hook,
        }
    }

    /// Tracker over an existing job.
    pub async fn track(&self, job_id: &JobId) -> Result<Tracker, TrackerError> {
        Tracker::load(
            self.kv.clone(),
            self.keys.clone(),
            self.clock.clone(),
            job_id,
            self.hook.clone(),
        )
        .await
    }

    /// Tracker over a record that still has to be saved.
    pub fn new_tracker(&self, stats: JobStats) -> Tracker {
        Tracker::new(
            self.kv.clone(),
            self.keys.clone(),
            self.clock.clone(),
            stats,
            self.hook.clone(),
        )
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run the reaper and the status retry loop until `cancel` fires.
    pub fn serve(self: Arc<Self>, options: LcmOptions, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let mut reaper = tokio::time::interval_at(
                start + options.reaper_initial_delay,
                options.reaper_interval,
            );
            let mut retries = tokio::time::interval_at(start + options.retry_interval, options.retry_interval);
            reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            retries.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                max_update_hours = options.max_update.as_secs() / 3600,
                max_dangling_hours = options.max_dangling.as_secs() / 3600,
                "lifecycle controller started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = reaper.tick() => {
                        match self.reap(&options).await {
                            Ok(report) => info!(?report, "reaper pass finished"),
                            Err(e) => warn!(error = %e, "reaper pass failed"),
                        }
                    }
                    _ = retries.tick() => {
                        match self.process_status_retries().await {
                            Ok(0) => {}
                            Ok(n) => debug!(handled = n, "status update retries processed"),
                            Err(e) => warn!(error = %e, "status update retry pass failed"),
                        }
                    }
                }
            }
            info!("lifecycle controller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use jobservice_core::{JobKind, JobStatus, ManualClock};

    use super::*;
    use crate::hook::{HookAgentOptions, HookClient, shard_for};
    use crate::kv::InMemoryStore;
    use crate::tracker::tests::RecordingHook;

    const HOOK_URL: &str = "http://hooks.local/h";

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()))
    }

    async fn hooked_job(lcm: &LifecycleController) -> JobId {
        let mut stats = JobStats::new(JobId::generate(), "SAMPLE", JobKind::Generic, lcm.clock().unix());
        stats.status_hook = Some(HOOK_URL.to_string());
        let mut tracker = lcm.new_tracker(stats);
        tracker.save().await.unwrap();
        tracker.job_id().clone()
    }

    #[tokio::test]
    async fn tracked_jobs_report_to_the_status_hook() {
        let hook = Arc::new(RecordingHook::default());
        let lcm = LifecycleController::with_hook(
            Arc::new(InMemoryStore::new()),
            Keys::new("t"),
            clock(),
            Some(hook.clone()),
        );
        let id = hooked_job(&lcm).await;

        let mut tracker = lcm.track(&id).await.unwrap();
        assert!(tracker.run().await.unwrap());

        let changes = hook.changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, HOOK_URL);
        assert_eq!(changes[0].1.status, JobStatus::Running);
        assert_eq!(changes[0].1.revision, tracker.revision());
    }

    #[tokio::test]
    async fn agent_backed_controller_queues_hook_events() {
        let kv = Arc::new(InMemoryStore::new());
        let keys = Keys::new("t");
        let clock = clock();
        let options = HookAgentOptions::default();
        let shards = options.shards;
        let agent = Arc::new(HookAgent::new(
            kv.clone(),
            keys.clone(),
            clock.clone(),
            Arc::new(HookClient::new(Duration::from_secs(1), None).unwrap()),
            options,
        ));
        let lcm = LifecycleController::new(kv.clone(), keys.clone(), clock, Some(agent));
        let id = hooked_job(&lcm).await;

        let mut tracker = lcm.track(&id).await.unwrap();
        tracker.run().await.unwrap();
        tracker.check_in("halfway").await.unwrap();

        let queue = keys.hook_queue(shard_for(HOOK_URL, shards));
        assert_eq!(kv.llen(&queue).await.unwrap(), 2);
        let head: HookEvent = serde_json::from_str(&kv.lindex(&queue, 0).await.unwrap().unwrap()).unwrap();
        assert_eq!(head.change.job_id, id);
        assert_eq!(head.change.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn controller_without_hooks_tracks_silently() {
        let kv = Arc::new(InMemoryStore::new());
        let lcm = LifecycleController::new(kv.clone(), Keys::new("t"), clock(), None);
        let id = hooked_job(&lcm).await;

        let mut tracker = lcm.track(&id).await.unwrap();
        assert!(tracker.succeed().await.unwrap());
        assert!(kv.scan(0, "t:hooks:*", 100).await.unwrap().1.is_empty());
    }
}
