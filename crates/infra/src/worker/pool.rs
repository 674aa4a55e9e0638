//! The worker pool.
//!
//! `workers` tasks pop job ids from the priority queue, then the default
//! queue, and run them one at a time. A mover task promotes due entries of
//! the delayed set into the priority queue, a heartbeat task advertises the
//! pool, and the periodic scheduler runs alongside.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobservice_config::LoggerConfig;
use jobservice_core::{Clock, CronSpec, JobId, JobKind, JobStats, JobStatus, Parameters};
use jobservice_jobs::{HandlerError, JobDescriptor, JobRegistry, OpCommand};
use jobservice_observability::JobLogger;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::PoolError;
use super::context::WorkerJobContext;
use super::dispatch::{
    Dispatcher, IN_PROGRESS_OP, IN_PROGRESS_POOL, IN_PROGRESS_STARTED, NewJob, StopOutcome,
};
use super::stats::{Heartbeat, PoolCounters, PoolHealth, PoolStatus, WorkerPoolStats};
use crate::kv::{KvError, KvStore, Keys, ZAddMode, scan_all};
use crate::lcm::LifecycleController;
use crate::period::{PeriodicScheduler, SchedulerOptions};
use crate::retry::RetryPolicy;
use crate::tracker::Tracker;

/// Delayed entries promoted per mover pass.
const PROMOTE_BATCH: usize = 100;

/// Heartbeats of pools dead this long are removed.
const HEARTBEAT_PRUNE_SECS: i64 = 24 * 3600;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub workers: usize,
    /// Blocking pop timeout; bounds how long shutdown waits on an idle worker.
    pub dequeue_timeout: Duration,
    pub mover_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Base delay of handler retries.
    pub retry_base: Duration,
    pub job_loggers: Vec<LoggerConfig>,
    pub scheduler: SchedulerOptions,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 10,
            dequeue_timeout: Duration::from_secs(1),
            mover_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            retry_base: Duration::from_secs(10),
            job_loggers: Vec::new(),
            scheduler: SchedulerOptions::default(),
        }
    }
}

impl PoolOptions {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_job_loggers(mut self, loggers: Vec<LoggerConfig>) -> Self {
        self.job_loggers = loggers;
        self
    }

    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub fn with_mover_interval(mut self, interval: Duration) -> Self {
        self.mover_interval = interval;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerOptions) -> Self {
        self.scheduler = scheduler;
        self
    }
}

struct PoolInner {
    kv: Arc<dyn KvStore>,
    keys: Keys,
    clock: Arc<dyn Clock>,
    registry: Arc<JobRegistry>,
    dispatcher: Dispatcher,
    scheduler: Arc<PeriodicScheduler>,
    options: PoolOptions,
    pool_id: String,
    started_at: i64,
    counters: PoolCounters,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
    cancel: Mutex<Option<CancellationToken>>,
    system: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("pool_id", &self.inner.pool_id)
            .field("workers", &self.inner.options.workers)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: Keys,
        clock: Arc<dyn Clock>,
        lcm: Arc<LifecycleController>,
        registry: Arc<JobRegistry>,
        options: PoolOptions,
    ) -> Self {
        let dispatcher = Dispatcher::new(kv.clone(), keys.clone(), clock.clone(), lcm);
        let scheduler = Arc::new(PeriodicScheduler::new(
            kv.clone(),
            keys.clone(),
            clock.clone(),
            dispatcher.clone(),
            options.scheduler.clone(),
        ));
        let started_at = clock.unix();
        Self {
            inner: Arc::new(PoolInner {
                kv,
                keys,
                clock,
                registry,
                dispatcher,
                scheduler,
                options,
                pool_id: crate::instance_id(),
                started_at,
                counters: PoolCounters::default(),
            }),
            cancel: Mutex::new(None),
            system: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.inner.pool_id
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &Arc<PeriodicScheduler> {
        &self.inner.scheduler
    }

    pub fn counters(&self) -> super::CounterSnapshot {
        self.inner.counters.snapshot()
    }

    /// Check the store, recover orphaned jobs and start all pool tasks.
    ///
    /// Handlers observe a child of `root` as their system cancellation; it
    /// fires on `root` or on [`WorkerPool::stop`], as do the pool's own loops.
    pub async fn start(&self, root: &CancellationToken) -> Result<(), PoolError> {
        let inner = &self.inner;
        inner.kv.ping().await?;
        inner.beat().await?;
        let recovered = inner.recover_in_progress().await?;
        let policies = inner.scheduler.recover().await?;

        let cancel = root.child_token();
        let system = root.child_token();
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for worker in 0..inner.options.workers.max(1) {
            let inner = inner.clone();
            let cancel = cancel.clone();
            let system = system.clone();
            tasks.push(tokio::spawn(async move {
                inner.work(worker, cancel, system).await;
            }));
        }
        tasks.push(tokio::spawn(inner.clone().move_due(cancel.clone())));
        tasks.push(tokio::spawn(inner.clone().heartbeat(cancel.clone())));
        tasks.push(inner.scheduler.clone().spawn(cancel.clone()));
        *self.cancel.lock().unwrap_or_else(|p| p.into_inner()) = Some(cancel);
        *self.system.lock().unwrap_or_else(|p| p.into_inner()) = Some(system);

        info!(
            pool_id = %inner.pool_id,
            workers = inner.options.workers,
            jobs = ?inner.registry.names(),
            recovered,
            policies,
            "worker pool started"
        );
        Ok(())
    }

    /// Stop dispatching, interrupt in-flight jobs and wait for them to return.
    /// Interrupted jobs go back to the head of the priority queue still `Running`.
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().unwrap_or_else(|p| p.into_inner()).take() {
            cancel.cancel();
        }
        if let Some(system) = self.system.lock().unwrap_or_else(|p| p.into_inner()).take() {
            system.cancel();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker pool task panicked");
            }
        }
        if let Err(e) = self
            .inner
            .kv
            .hdel(&self.inner.keys.workers(), &self.inner.pool_id)
            .await
        {
            warn!(error = %e, "failed to remove pool heartbeat");
        }
        info!(pool_id = %self.inner.pool_id, counters = ?self.counters(), "worker pool stopped");
    }

    fn descriptor(&self, name: &str) -> Result<&JobDescriptor, PoolError> {
        self.inner
            .registry
            .is_known(name)
            .ok_or_else(|| PoolError::UnknownJob(name.to_string()))
    }

    /// Queue a job to run as soon as a worker is free.
    pub async fn enqueue(
        &self,
        name: &str,
        params: Parameters,
        is_unique: bool,
        hook: Option<String>,
    ) -> Result<JobStats, PoolError> {
        self.descriptor(name)?;
        let job = NewJob::new(name, params).unique(is_unique).hook(hook);
        Ok(self.inner.dispatcher.launch(job).await?)
    }

    /// Queue a job to run `delay_seconds` from now.
    pub async fn schedule(
        &self,
        name: &str,
        params: Parameters,
        delay_seconds: u64,
        is_unique: bool,
        hook: Option<String>,
    ) -> Result<JobStats, PoolError> {
        self.descriptor(name)?;
        if delay_seconds == 0 {
            return Err(PoolError::InvalidArgument(
                "schedule delay must be positive".to_string(),
            ));
        }
        let run_at = self.inner.clock.unix() + delay_seconds as i64;
        let job = NewJob::new(name, params)
            .unique(is_unique)
            .hook(hook)
            .at(run_at);
        Ok(self.inner.dispatcher.launch(job).await?)
    }

    /// Create a periodic policy; returns the parent record.
    pub async fn periodically_enqueue(
        &self,
        name: &str,
        params: Parameters,
        cron: &CronSpec,
        is_unique: bool,
        hook: Option<String>,
    ) -> Result<JobStats, PoolError> {
        self.descriptor(name)?;
        Ok(self
            .inner
            .scheduler
            .schedule(name, params, cron, is_unique, hook)
            .await?)
    }

    pub async fn stop_job(&self, job_id: &JobId) -> Result<StopOutcome, PoolError> {
        let tracker = self.inner.dispatcher.lcm().track(job_id).await?;
        if tracker.job().kind == JobKind::Periodic {
            self.inner.scheduler.unschedule(job_id).await?;
            return Ok(StopOutcome::Unscheduled);
        }
        Ok(self.inner.dispatcher.request_stop(job_id).await?)
    }

    /// Launch a fresh copy of a job that ended in `Error` or `Stopped`.
    pub async fn retry_job(&self, job_id: &JobId) -> Result<JobStats, PoolError> {
        let tracker = self.inner.dispatcher.lcm().track(job_id).await?;
        let job = tracker.job();
        if job.kind == JobKind::Periodic {
            return Err(PoolError::InvalidState(format!(
                "periodic job '{job_id}' cannot be retried"
            )));
        }
        if !matches!(job.status, JobStatus::Error | JobStatus::Stopped) {
            return Err(PoolError::InvalidState(format!(
                "job '{job_id}' is {} and cannot be retried",
                job.status
            )));
        }
        self.descriptor(&job.name)?;
        let retry = NewJob::new(job.name.clone(), job.parameters.clone())
            .unique(job.is_unique)
            .hook(job.status_hook.clone());
        let stats = self.inner.dispatcher.launch(retry).await?;
        info!(job_id = %job_id, retry_id = %stats.id, "job relaunched");
        Ok(stats)
    }

    /// Heartbeats of every pool in the namespace plus this process' counters.
    pub async fn stats(&self) -> Result<WorkerPoolStats, PoolError> {
        let now = self.inner.clock.unix();
        let mut pools: Vec<PoolStatus> = self
            .inner
            .heartbeats()
            .await?
            .into_values()
            .map(|heartbeat| PoolStatus {
                status: heartbeat.health_at(now),
                heartbeat,
            })
            .collect();
        pools.sort_by(|a, b| a.heartbeat.pool_id.cmp(&b.heartbeat.pool_id));
        Ok(WorkerPoolStats {
            pools,
            counters: self.counters(),
        })
    }
}

impl PoolInner {
    async fn work(&self, worker: usize, cancel: CancellationToken, system: CancellationToken) {
        let queues = [self.keys.queue_priority(), self.keys.queue_default()];
        debug!(worker, "worker started");
        while !cancel.is_cancelled() {
            // Not raced against `cancel`: a dropped pop could lose a job id.
            match self.kv.blpop(&queues, self.options.dequeue_timeout).await {
                Ok(Some((queue, raw))) if cancel.is_cancelled() => {
                    // Popped while stopping: hand it back untouched.
                    if let Err(e) = self.kv.lpush(&queue, &raw).await {
                        error!(worker, job_id = %raw, error = %e, "failed to return job to its queue");
                    }
                }
                Ok(Some((_, raw))) => self.process(&raw, &system).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(worker, error = %e, "dequeue failed");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        debug!(worker, "worker stopped");
    }

    async fn process(&self, raw: &str, system: &CancellationToken) {
        let Ok(job_id) = raw.parse::<JobId>() else {
            warn!(raw, "dropping malformed job id from queue");
            return;
        };
        let _running = self.counters.started();

        let mut tracker = match self.dispatcher.lcm().track(&job_id).await {
            Ok(tracker) => tracker,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "cannot load dequeued job");
                return;
            }
        };
        if tracker.status().is_terminal() {
            debug!(job_id = %job_id, status = %tracker.status(), "skipping finished job");
            return;
        }
        if tracker.job().kind == JobKind::Periodic {
            warn!(job_id = %job_id, "periodic parent found on a queue, ignored");
            return;
        }

        let in_progress = self.keys.in_progress(job_id.as_str());
        if self.op_command(&in_progress).await == Some(OpCommand::Stop) {
            self.finish_stopped(&mut tracker).await;
            self.clear_in_progress(&in_progress).await;
            return;
        }

        let Some(descriptor) = self.registry.is_known(&tracker.job().name) else {
            error!(job_id = %job_id, job_name = %tracker.job().name, "no handler registered");
            if let Err(e) = tracker.fail().await {
                warn!(job_id = %job_id, error = %e, "failed to mark job as error");
            }
            self.counters.failed();
            return;
        };

        if tracker.status() != JobStatus::Running {
            match tracker.run().await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "cannot move job to running, requeued");
                    self.requeue(&job_id).await;
                    return;
                }
            }
        }

        let now = self.clock.unix();
        if let Err(e) = self
            .kv
            .hset(
                &in_progress,
                &[
                    (IN_PROGRESS_POOL.to_string(), self.pool_id.clone()),
                    (IN_PROGRESS_STARTED.to_string(), now.to_string()),
                ],
            )
            .await
        {
            warn!(job_id = %job_id, error = %e, "failed to record in-progress job");
        }

        let fails = tracker.job().fails;
        let result = self.execute(descriptor, tracker, system).await;
        let mut tracker = result.tracker;
        match result.outcome {
            Ok(()) => {
                if let Err(e) = tracker.succeed().await {
                    warn!(job_id = %job_id, error = %e, "failed to mark job as success");
                }
                self.counters.succeeded();
            }
            Err(e) if e.is_stopped() => self.finish_stopped(&mut tracker).await,
            Err(e) if system.is_cancelled() => {
                info!(job_id = %job_id, error = %e, "job interrupted by shutdown, requeued");
                self.requeue(&job_id).await;
            }
            Err(e) => self.finish_failed(descriptor, &mut tracker, fails, e).await,
        }
        self.clear_in_progress(&in_progress).await;
    }

    async fn execute(
        &self,
        descriptor: &JobDescriptor,
        tracker: Tracker,
        system: &CancellationToken,
    ) -> Execution {
        let job_id = tracker.job_id().clone();
        let params = tracker.job().parameters.clone();
        let logger = JobLogger::open(job_id.as_str(), &self.options.job_loggers).unwrap_or_else(|e| {
            warn!(job_id = %job_id, error = %e, "job logger unavailable");
            JobLogger::noop(job_id.as_str())
        });
        let tracker = Arc::new(tokio::sync::Mutex::new(tracker));
        let ctx = WorkerJobContext::new(
            tracker.clone(),
            job_id.clone(),
            params.clone(),
            self.kv.clone(),
            self.keys.clone(),
            system.clone(),
            logger,
        );
        let handler = descriptor.create();

        info!(job_id = %job_id, job_name = %descriptor.name(), "job started");
        let joined = tokio::spawn(async move { handler.run(&ctx, &params).await }).await;
        let outcome = joined.unwrap_or_else(|e| Err(HandlerError::failed(format!("handler panicked: {e}"))));

        // The context was dropped with the task, so this is the last handle.
        let tracker = match Arc::try_unwrap(tracker) {
            Ok(mutex) => mutex.into_inner(),
            Err(shared) => {
                let guard = shared.lock().await;
                let job = guard.job().clone();
                drop(guard);
                self.dispatcher.lcm().new_tracker(job)
            }
        };
        Execution { tracker, outcome }
    }

    async fn finish_stopped(&self, tracker: &mut Tracker) {
        match tracker.stop().await {
            Ok(_) => self.counters.stopped(),
            Err(e) => warn!(job_id = %tracker.job_id(), error = %e, "failed to mark job as stopped"),
        }
    }

    async fn finish_failed(
        &self,
        descriptor: &JobDescriptor,
        tracker: &mut Tracker,
        fails: u32,
        cause: HandlerError,
    ) {
        let job_id = tracker.job_id().clone();
        let attempt = fails + 1;
        let policy = RetryPolicy::job_retry(descriptor.max_fails(), self.options.retry_base);
        if descriptor.should_retry() && policy.should_retry(attempt) {
            let delay = policy.delay_for_attempt(attempt).as_secs().max(1) as i64;
            let run_at = self.clock.unix() + delay;
            let retried = async {
                tracker.record_failure(run_at).await.map_err(|e| e.to_string())?;
                self.kv
                    .zadd(&self.keys.scheduled(), job_id.as_str(), run_at as f64, ZAddMode::Always)
                    .await
                    .map_err(|e| e.to_string())
            }
            .await;
            match retried {
                Ok(()) => {
                    self.counters.retried();
                    warn!(job_id = %job_id, attempt, retry_in_secs = delay, error = %cause, "job failed, retry scheduled");
                    return;
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "cannot schedule retry"),
            }
        }
        error!(job_id = %job_id, attempt, error = %cause, "job failed");
        if let Err(e) = tracker.fail().await {
            warn!(job_id = %job_id, error = %e, "failed to mark job as error");
        }
        self.counters.failed();
    }

    async fn op_command(&self, in_progress: &str) -> Option<OpCommand> {
        match self.kv.hget(in_progress, IN_PROGRESS_OP).await {
            Ok(raw) => raw.as_deref().and_then(OpCommand::parse),
            Err(e) => {
                warn!(error = %e, "failed to read op command");
                None
            }
        }
    }

    async fn requeue(&self, job_id: &JobId) {
        if let Err(e) = self.kv.lpush(&self.keys.queue_priority(), job_id.as_str()).await {
            error!(job_id = %job_id, error = %e, "failed to requeue job");
        }
    }

    async fn clear_in_progress(&self, key: &str) {
        if let Err(e) = self.kv.del(key).await {
            warn!(error = %e, "failed to clear in-progress record");
        }
    }

    async fn move_due(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.mover_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.promote_due().await {
                        Ok(0) => {}
                        Ok(n) => debug!(promoted = n, "due jobs promoted"),
                        Err(e) => warn!(error = %e, "promoting due jobs failed"),
                    }
                }
            }
        }
    }

    /// Move delayed jobs whose time has come to the priority queue.
    async fn promote_due(&self) -> Result<usize, KvError> {
        let scheduled = self.keys.scheduled();
        let now = self.clock.unix() as f64;
        let due = self
            .kv
            .zrange_by_score(&scheduled, f64::NEG_INFINITY, now, 0, Some(PROMOTE_BATCH))
            .await?;
        let mut promoted = 0;
        for (id, _) in due {
            // Only the node that removed the entry pushes it.
            if self.kv.zrem(&scheduled, &id).await? {
                self.kv.rpush(&self.keys.queue_priority(), &id).await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!(pool_id = %self.pool_id, error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }

    async fn beat(&self) -> Result<(), PoolError> {
        let heartbeat = Heartbeat {
            pool_id: self.pool_id.clone(),
            started_at: self.started_at,
            heartbeat_at: self.clock.unix(),
            job_names: self.registry.names(),
            concurrency: self.options.workers,
        };
        let raw = serde_json::to_string(&heartbeat)?;
        self.kv
            .hset(&self.keys.workers(), &[(self.pool_id.clone(), raw)])
            .await?;
        Ok(())
    }

    async fn heartbeats(&self) -> Result<HashMap<String, Heartbeat>, PoolError> {
        let raw = self.kv.hgetall(&self.keys.workers()).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(pool_id, value)| match serde_json::from_str::<Heartbeat>(&value) {
                Ok(heartbeat) => Some((pool_id, heartbeat)),
                Err(e) => {
                    warn!(pool_id, error = %e, "ignoring malformed heartbeat");
                    None
                }
            })
            .collect())
    }

    /// Requeue jobs whose owning pool stopped heartbeating. The jobs keep
    /// their `Running` status and fail count.
    async fn recover_in_progress(&self) -> Result<usize, PoolError> {
        let now = self.clock.unix();
        let heartbeats = self.heartbeats().await?;
        for (pool_id, heartbeat) in &heartbeats {
            if now - heartbeat.heartbeat_at > HEARTBEAT_PRUNE_SECS {
                self.kv.hdel(&self.keys.workers(), pool_id).await?;
            }
        }

        let mut recovered = 0;
        for key in scan_all(self.kv.as_ref(), &self.keys.in_progress_pattern()).await? {
            let Some(raw_id) = self.keys.job_id_from_in_progress_key(&key) else {
                continue;
            };
            let Some(owner) = self.kv.hget(&key, IN_PROGRESS_POOL).await? else {
                continue;
            };
            let alive = heartbeats
                .get(&owner)
                .is_some_and(|hb| hb.health_at(now) == PoolHealth::Healthy);
            if owner == self.pool_id || alive {
                continue;
            }
            let Ok(job_id) = raw_id.parse::<JobId>() else {
                continue;
            };
            match self.dispatcher.lcm().track(&job_id).await {
                Ok(tracker) if !tracker.status().is_terminal() => {
                    self.kv.hdel(&key, IN_PROGRESS_POOL).await?;
                    self.kv.rpush(&self.keys.queue_priority(), job_id.as_str()).await?;
                    info!(job_id = %job_id, dead_pool = %owner, "recovered job from dead pool");
                    recovered += 1;
                }
                Ok(_) | Err(_) => {
                    self.kv.del(&key).await?;
                }
            }
        }
        Ok(recovered)
    }
}

struct Execution {
    tracker: Tracker,
    outcome: Result<(), HandlerError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryStore;
    use async_trait::async_trait;
    use jobservice_core::SystemClock;
    use jobservice_jobs::{JobContext, JobHandler, ParamError, SAMPLE_JOB, SampleJob};
    use serde_json::json;

    /// Fails every run.
    #[derive(Default)]
    struct Flaky;

    #[async_trait]
    impl JobHandler for Flaky {
        fn max_fails(&self) -> u32 {
            3
        }
        fn should_retry(&self) -> bool {
            true
        }
        fn validate(&self, _: &Parameters) -> Result<(), ParamError> {
            Ok(())
        }
        async fn run(&self, _: &dyn JobContext, _: &Parameters) -> Result<(), HandlerError> {
            Err(HandlerError::failed("flaky"))
        }
    }

    struct Harness {
        kv: Arc<InMemoryStore>,
        pool: WorkerPool,
        root: CancellationToken,
    }

    async fn harness() -> Harness {
        let kv = Arc::new(InMemoryStore::new());
        let keys = Keys::new("t");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let lcm = Arc::new(LifecycleController::new(kv.clone(), keys.clone(), clock.clone(), None));
        let registry = JobRegistry::builder()
            .register_default::<SampleJob>(SAMPLE_JOB)
            .unwrap()
            .register_default::<Flaky>("FLAKY")
            .unwrap()
            .build();
        let options = PoolOptions::default()
            .with_workers(2)
            .with_retry_base(Duration::from_millis(10))
            .with_mover_interval(Duration::from_millis(50));
        let pool = WorkerPool::new(kv.clone(), keys, clock, lcm, Arc::new(registry), options);
        let root = CancellationToken::new();
        pool.start(&root).await.unwrap();
        Harness { kv, pool, root }
    }

    fn params(value: serde_json::Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    async fn wait_for(pool: &WorkerPool, id: &JobId, status: JobStatus) -> JobStats {
        for _ in 0..200 {
            let tracker = pool.inner.dispatcher.lcm().track(id).await.unwrap();
            if tracker.status() == status {
                return tracker.job().clone();
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {id} never reached {status}");
    }

    #[tokio::test]
    async fn enqueued_job_runs_to_success() {
        let h = harness().await;
        let stats = h
            .pool
            .enqueue(SAMPLE_JOB, params(json!({"steps": 2, "interval_ms": 10})), false, None)
            .await
            .unwrap();
        assert_eq!(stats.status, JobStatus::Pending);

        let done = wait_for(&h.pool, &stats.id, JobStatus::Success).await;
        assert_eq!(done.check_in.as_deref(), Some("step 2/2"));
        assert_eq!(h.pool.counters().succeeded, 1);
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn unique_jobs_conflict_until_finished() {
        let h = harness().await;
        let p = params(json!({"image": "demo/x:v1", "steps": 1, "interval_ms": 10}));
        let first = h.pool.enqueue(SAMPLE_JOB, p.clone(), true, None).await.unwrap();
        let second = h.pool.enqueue(SAMPLE_JOB, p.clone(), true, None).await;
        assert!(matches!(second, Err(PoolError::Dispatch(_))));

        wait_for(&h.pool, &first.id, JobStatus::Success).await;
        h.pool.enqueue(SAMPLE_JOB, p, true, None).await.unwrap();
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn failing_job_retries_then_errors() {
        let h = harness().await;
        let stats = h.pool.enqueue("FLAKY", Parameters::new(), false, None).await.unwrap();
        let done = wait_for(&h.pool, &stats.id, JobStatus::Error).await;
        assert_eq!(done.fails, 2);
        assert_eq!(h.pool.counters().retried, 2);
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn stop_reaches_running_and_waiting_jobs() {
        let h = harness().await;
        let running = h
            .pool
            .enqueue(SAMPLE_JOB, params(json!({"steps": 50, "interval_ms": 20})), false, None)
            .await
            .unwrap();
        wait_for(&h.pool, &running.id, JobStatus::Running).await;
        assert_eq!(h.pool.stop_job(&running.id).await.unwrap(), StopOutcome::Signalled);
        wait_for(&h.pool, &running.id, JobStatus::Stopped).await;

        let delayed = h
            .pool
            .schedule(SAMPLE_JOB, Parameters::new(), 3600, false, None)
            .await
            .unwrap();
        assert_eq!(delayed.status, JobStatus::Scheduled);
        assert_eq!(h.pool.stop_job(&delayed.id).await.unwrap(), StopOutcome::Stopped);
        assert_eq!(h.kv.zcard(&Keys::new("t").scheduled()).await.unwrap(), 0);
        assert_eq!(
            h.pool.stop_job(&delayed.id).await.unwrap(),
            StopOutcome::AlreadyFinished
        );
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn stopping_the_pool_requeues_running_jobs() {
        let h = harness().await;
        let stats = h
            .pool
            .enqueue(SAMPLE_JOB, params(json!({"steps": 10, "interval_ms": 30_000})), false, None)
            .await
            .unwrap();
        wait_for(&h.pool, &stats.id, JobStatus::Running).await;

        tokio::time::timeout(Duration::from_secs(5), h.pool.stop())
            .await
            .expect("pool stop waited out the running job");

        let keys = Keys::new("t");
        assert_eq!(
            h.kv.lindex(&keys.queue_priority(), 0).await.unwrap().as_deref(),
            Some(stats.id.as_str())
        );
        assert!(!h.kv.exists(&keys.in_progress(stats.id.as_str())).await.unwrap());
        let tracker = h.pool.inner.dispatcher.lcm().track(&stats.id).await.unwrap();
        assert_eq!(tracker.status(), JobStatus::Running);
        assert_eq!(tracker.job().fails, 0);
        assert!(!h.root.is_cancelled());
    }

    #[tokio::test]
    async fn retry_relaunches_only_failed_or_stopped_jobs() {
        let h = harness().await;
        let stats = h
            .pool
            .schedule(SAMPLE_JOB, Parameters::new(), 3600, false, None)
            .await
            .unwrap();
        assert!(matches!(
            h.pool.retry_job(&stats.id).await,
            Err(PoolError::InvalidState(_))
        ));
        h.pool.stop_job(&stats.id).await.unwrap();
        let fresh = h.pool.retry_job(&stats.id).await.unwrap();
        assert_ne!(fresh.id, stats.id);
        assert_eq!(fresh.kind, JobKind::Generic);
        wait_for(&h.pool, &fresh.id, JobStatus::Success).await;
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn unknown_names_and_zero_delays_are_rejected() {
        let h = harness().await;
        assert!(matches!(
            h.pool.enqueue("NOPE", Parameters::new(), false, None).await,
            Err(PoolError::UnknownJob(_))
        ));
        assert!(matches!(
            h.pool.schedule(SAMPLE_JOB, Parameters::new(), 0, false, None).await,
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.pool.stop_job(&JobId::generate()).await,
            Err(PoolError::NotFound(_))
        ));
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn stats_report_this_pool_as_healthy() {
        let h = harness().await;
        let stats = h.pool.stats().await.unwrap();
        assert_eq!(stats.pools.len(), 1);
        assert_eq!(stats.pools[0].status, PoolHealth::Healthy);
        assert_eq!(stats.pools[0].heartbeat.concurrency, 2);
        h.pool.stop().await;
        assert!(h.pool.stats().await.unwrap().pools.is_empty());
    }

    #[tokio::test]
    async fn jobs_of_dead_pools_are_recovered() {
        let h = harness().await;
        h.pool.stop().await;

        let id = h
            .pool
            .enqueue(SAMPLE_JOB, params(json!({"steps": 1, "interval_ms": 10})), false, None)
            .await
            .unwrap()
            .id;
        // Simulate a crash: the job was popped and marked running by a pool
        // that no longer heartbeats.
        let keys = Keys::new("t");
        h.kv.lpop(&keys.queue_default()).await.unwrap();
        let mut tracker = h.pool.inner.dispatcher.lcm().track(&id).await.unwrap();
        tracker.run().await.unwrap();
        h.kv.hset(
            &keys.in_progress(id.as_str()),
            &[(IN_PROGRESS_POOL.to_string(), "dead-pool".to_string())],
        )
        .await
        .unwrap();

        h.pool.start(&h.root).await.unwrap();
        wait_for(&h.pool, &id, JobStatus::Success).await;
        h.pool.stop().await;
    }
}
