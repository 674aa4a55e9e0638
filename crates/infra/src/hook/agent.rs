//! Durable, sharded status hook delivery.
//!
//! Events are appended to `{ns}:hooks:queue:{shard}` where the shard is
//! derived from the URL, so all events for one URL share a queue. Each shard
//! has exactly one delivery task, guarded across nodes by a lease key. The
//! head event leaves the queue only once delivered or dropped, which keeps
//! retries in front of later events for the same URL.
//!
//! Trackers enqueue after their compare-and-set, so two writers of one job
//! can enqueue out of revision order. The shard owner remembers the highest
//! revision delivered per job and drops anything not newer, so a receiver
//! never sees a job's revision go backwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobservice_core::{Clock, HookEvent};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::HookError;
use super::client::{Delivery, HookSender};
use crate::kv::{KvStore, Keys};
use crate::retry::RetryPolicy;
use crate::tracker::STATS_TTL;

#[derive(Debug, Clone)]
pub struct HookAgentOptions {
    pub shards: u32,
    /// Attempts per event before it is dropped.
    pub max_retries: u32,
    /// Delay before the first redelivery; doubles per attempt.
    pub backoff_base: Duration,
    /// How long shutdown keeps delivering queued events.
    pub drain_grace: Duration,
    pub lease_ttl: Duration,
    /// Upper bound on any single idle wait.
    pub idle_poll: Duration,
}

impl Default for HookAgentOptions {
    fn default() -> Self {
        Self {
            shards: 4,
            max_retries: 10,
            backoff_base: Duration::from_secs(1),
            drain_grace: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(30),
            idle_poll: Duration::from_secs(1),
        }
    }
}

impl HookAgentOptions {
    pub fn with_shards(mut self, shards: u32) -> Self {
        self.shards = shards.max(1);
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }
}

/// Delivery counters since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HookStats {
    pub delivered: u64,
    pub retried: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

/// Shard of a hook URL: first four bytes of its SHA-256, modulo `shards`.
pub fn shard_for(url: &str, shards: u32) -> u32 {
    let digest = Sha256::digest(url.as_bytes());
    let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    hash % shards.max(1)
}

enum Step {
    /// Queue empty.
    Idle,
    /// Head event not due yet.
    Wait(Duration),
    Progress,
}

struct Inner {
    kv: Arc<dyn KvStore>,
    keys: Keys,
    clock: Arc<dyn Clock>,
    sender: Arc<dyn HookSender>,
    options: HookAgentOptions,
    policy: RetryPolicy,
    wake: Vec<Notify>,
    counters: Counters,
    node_id: String,
}

pub struct HookAgent {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for HookAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookAgent")
            .field("node_id", &self.inner.node_id)
            .field("shards", &self.inner.options.shards)
            .finish()
    }
}

impl HookAgent {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: Keys,
        clock: Arc<dyn Clock>,
        sender: Arc<dyn HookSender>,
        options: HookAgentOptions,
    ) -> Self {
        let shards = options.shards.max(1);
        let policy = RetryPolicy::hook_delivery(options.backoff_base);
        Self {
            inner: Arc::new(Inner {
                kv,
                keys,
                clock,
                sender,
                options: HookAgentOptions { shards, ..options },
                policy,
                wake: (0..shards).map(|_| Notify::new()).collect(),
                counters: Counters::default(),
                node_id: crate::instance_id(),
            }),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.inner.options.max_retries
    }

    /// Spawn one delivery task per shard.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if !tasks.is_empty() {
            return;
        }
        for shard in 0..self.inner.options.shards {
            let inner = self.inner.clone();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move { inner.run_shard(shard, cancel).await }));
        }
        info!(shards = self.inner.options.shards, node_id = %self.inner.node_id, "hook agent started");
    }

    /// Queue an event behind earlier events for the same URL.
    pub async fn trigger(&self, event: HookEvent) -> Result<(), HookError> {
        if event.url.trim().is_empty() {
            return Err(HookError::EmptyUrl);
        }
        let shard = shard_for(&event.url, self.inner.options.shards);
        let raw = serde_json::to_string(&event)?;
        self.inner
            .kv
            .rpush(&self.inner.keys.hook_queue(shard), &raw)
            .await?;
        debug!(
            url = %event.url,
            job_id = %event.change.job_id,
            revision = event.change.revision,
            shard,
            "hook event queued"
        );
        if let Some(wake) = self.inner.wake.get(shard as usize) {
            wake.notify_one();
        }
        Ok(())
    }

    pub fn stats(&self) -> HookStats {
        let c = &self.inner.counters;
        HookStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the shard tasks after delivering what is due within the grace period.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "hook shard task panicked");
            }
        }
        info!(stats = ?self.stats(), "hook agent stopped");
    }
}

impl Inner {
    async fn run_shard(&self, shard: u32, cancel: CancellationToken) {
        let lease = self.keys.hook_lease(shard);
        let mut holding = false;

        while !cancel.is_cancelled() {
            if !self.hold_lease(&lease, holding).await {
                holding = false;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.options.idle_poll) => {}
                }
                continue;
            }
            holding = true;

            let pause = match self.process_head(shard).await {
                Ok(Step::Progress) => continue,
                Ok(Step::Idle) => self.options.idle_poll,
                Ok(Step::Wait(d)) => d.min(self.options.idle_poll),
                Err(e) => {
                    warn!(shard, error = %e, "hook delivery step failed");
                    self.options.idle_poll
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake[shard as usize].notified() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }

        if holding || self.hold_lease(&lease, false).await {
            self.drain(shard).await;
            if let Err(e) = self.kv.del_if_eq(&lease, &self.node_id).await {
                warn!(shard, error = %e, "failed to release hook shard lease");
            }
        }
        debug!(shard, "hook shard stopped");
    }

    async fn hold_lease(&self, lease: &str, holding: bool) -> bool {
        let result = if holding {
            self.kv
                .expire_if_eq(lease, &self.node_id, self.options.lease_ttl)
                .await
        } else {
            self.kv
                .set_nx(lease, &self.node_id, Some(self.options.lease_ttl))
                .await
        };
        result.unwrap_or_else(|e| {
            warn!(error = %e, "hook shard lease check failed");
            false
        })
    }

    async fn drain(&self, shard: u32) {
        let deadline = tokio::time::Instant::now() + self.options.drain_grace;
        let drained = tokio::time::timeout_at(deadline, async {
            loop {
                match self.process_head(shard).await {
                    Ok(Step::Progress) => continue,
                    Ok(Step::Idle) => return true,
                    Ok(Step::Wait(d)) => tokio::time::sleep(d).await,
                    Err(e) => {
                        warn!(shard, error = %e, "hook drain step failed");
                        return false;
                    }
                }
            }
        })
        .await
        .unwrap_or(false);
        if !drained {
            let left = self
                .kv
                .llen(&self.keys.hook_queue(shard))
                .await
                .unwrap_or_default();
            if left > 0 {
                warn!(shard, left, "hook events left queued at shutdown");
            }
        }
    }

    async fn process_head(&self, shard: u32) -> Result<Step, HookError> {
        let queue = self.keys.hook_queue(shard);
        let Some(raw) = self.kv.lindex(&queue, 0).await? else {
            return Ok(Step::Idle);
        };
        let mut event: HookEvent = match serde_json::from_str(&raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(shard, error = %e, "dropping undecodable hook event");
                self.kv.lpop(&queue).await?;
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(Step::Progress);
            }
        };

        let delivered_key = self.keys.hook_delivered(event.change.job_id.as_str());
        let delivered = self
            .kv
            .get(&delivered_key)
            .await?
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(last) = delivered.filter(|last| event.change.revision <= *last) {
            self.kv.lpop(&queue).await?;
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                url = %event.url,
                job_id = %event.change.job_id,
                revision = event.change.revision,
                delivered = last,
                "superseded hook event dropped"
            );
            return Ok(Step::Progress);
        }

        let now_ms = self.clock.unix_millis();
        if event.next_attempt_at_ms > now_ms {
            let wait = (event.next_attempt_at_ms - now_ms) as u64;
            return Ok(Step::Wait(Duration::from_millis(wait)));
        }

        event.attempts += 1;
        let attempt = event.attempts;
        match self.sender.send(&event.url, &event.payload()).await {
            Delivery::Delivered(code) => {
                self.kv.lpop(&queue).await?;
                self.kv
                    .set(&delivered_key, &event.change.revision.to_string(), Some(STATS_TTL))
                    .await?;
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    url = %event.url,
                    job_id = %event.change.job_id,
                    revision = event.change.revision,
                    code,
                    attempt,
                    "hook delivered"
                );
            }
            Delivery::Drop(code) => {
                self.kv.lpop(&queue).await?;
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    url = %event.url,
                    job_id = %event.change.job_id,
                    code,
                    attempt,
                    "hook rejected by endpoint, dropped"
                );
            }
            Delivery::Retry(reason) => {
                event.retries_remaining = event.retries_remaining.saturating_sub(1);
                if event.retries_remaining == 0 || !self.policy.should_retry(attempt) {
                    self.kv.lpop(&queue).await?;
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        url = %event.url,
                        job_id = %event.change.job_id,
                        attempt,
                        reason = %reason,
                        "hook retries exhausted, dropped"
                    );
                } else {
                    let delay = self.policy.delay_for_attempt(attempt);
                    event.next_attempt_at_ms = now_ms + delay.as_millis() as i64;
                    self.kv
                        .lset(&queue, 0, &serde_json::to_string(&event)?)
                        .await?;
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    info!(
                        url = %event.url,
                        job_id = %event.change.job_id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "hook delivery will retry"
                    );
                }
            }
        }
        Ok(Step::Progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryStore;
    use async_trait::async_trait;
    use jobservice_core::{HookPayload, JobId, JobStatus, StatusChange, SystemClock};
    use std::collections::VecDeque;

    /// Replays scripted outcomes, then delivers.
    #[derive(Default)]
    struct ScriptedSender {
        script: Mutex<VecDeque<Delivery>>,
        seen: Mutex<Vec<(String, u64)>>,
    }

    impl ScriptedSender {
        fn with(script: Vec<Delivery>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen: Mutex::default(),
            }
        }

        fn seen(&self) -> Vec<(String, u64)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HookSender for ScriptedSender {
        async fn send(&self, url: &str, payload: &HookPayload) -> Delivery {
            self.seen.lock().unwrap().push((url.to_string(), payload.revision));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Delivery::Delivered(200))
        }
    }

    fn event(url: &str, job_id: &JobId, revision: u64) -> HookEvent {
        let change = StatusChange {
            job_id: job_id.clone(),
            status: JobStatus::Running,
            check_in: None,
            metadata: None,
            revision,
        };
        HookEvent::new(url, change, 1_700_000_000, 10)
    }

    fn agent(sender: Arc<ScriptedSender>) -> HookAgent {
        let options = HookAgentOptions::default()
            .with_shards(2)
            .with_backoff_base(Duration::from_millis(10))
            .with_idle_poll(Duration::from_millis(20))
            .with_drain_grace(Duration::from_millis(500));
        HookAgent::new(
            Arc::new(InMemoryStore::new()),
            Keys::new("t"),
            Arc::new(SystemClock),
            sender,
            options,
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn shard_is_stable_and_bounded() {
        let a = shard_for("http://sink/h", 4);
        assert_eq!(a, shard_for("http://sink/h", 4));
        assert!(a < 4);
        assert_eq!(shard_for("http://sink/h", 0), 0);
    }

    #[tokio::test]
    async fn retries_keep_per_url_order() {
        let sender = Arc::new(ScriptedSender::with(vec![
            Delivery::Retry("503".into()),
            Delivery::Retry("503".into()),
        ]));
        let agent = agent(sender.clone());
        let id = JobId::generate();
        for revision in 2..=4 {
            agent.trigger(event("http://sink/h", &id, revision)).await.unwrap();
        }
        agent.start();

        eventually(|| agent.stats().delivered == 3).await;
        let revisions: Vec<u64> = sender.seen().into_iter().map(|(_, r)| r).collect();
        assert_eq!(revisions, vec![2, 2, 2, 3, 4]);
        assert_eq!(agent.stats().retried, 2);
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn events_enqueued_out_of_revision_order_never_go_backwards() {
        let sender = Arc::new(ScriptedSender::default());
        let agent = agent(sender.clone());
        let id = JobId::generate();
        let other = JobId::generate();
        // A check-in committed at 3 is enqueued after the status change at 4.
        agent.trigger(event("http://sink/o", &id, 2)).await.unwrap();
        agent.trigger(event("http://sink/o", &id, 4)).await.unwrap();
        agent.trigger(event("http://sink/o", &id, 3)).await.unwrap();
        agent.trigger(event("http://sink/o", &other, 1)).await.unwrap();
        agent.trigger(event("http://sink/o", &id, 5)).await.unwrap();
        agent.start();

        eventually(|| agent.stats().delivered == 4).await;
        eventually(|| agent.stats().dropped == 1).await;
        let revisions: Vec<u64> = sender.seen().into_iter().map(|(_, r)| r).collect();
        assert_eq!(revisions, vec![2, 4, 1, 5]);
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn client_errors_are_dropped() {
        let sender = Arc::new(ScriptedSender::with(vec![Delivery::Drop(404)]));
        let agent = agent(sender.clone());
        agent.start();
        let id = JobId::generate();
        agent.trigger(event("http://sink/a", &id, 2)).await.unwrap();
        agent.trigger(event("http://sink/a", &id, 3)).await.unwrap();

        eventually(|| agent.stats().delivered == 1).await;
        assert_eq!(agent.stats().dropped, 1);
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_retries_drop_the_event() {
        let sender = Arc::new(ScriptedSender::with(
            (0..3).map(|_| Delivery::Retry("boom".into())).collect(),
        ));
        let agent = agent(sender.clone());
        agent.start();
        let mut e = event("http://sink/x", &JobId::generate(), 2);
        e.retries_remaining = 3;
        agent.trigger(e).await.unwrap();

        eventually(|| agent.stats().dropped == 1).await;
        assert_eq!(agent.stats().retried, 2);
        assert_eq!(sender.seen().len(), 3);
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_queued_events() {
        let sender = Arc::new(ScriptedSender::default());
        let agent = agent(sender.clone());
        agent.start();
        let id = JobId::generate();
        for revision in 2..=4 {
            agent.trigger(event("http://sink/d", &id, revision)).await.unwrap();
        }
        agent.shutdown().await;
        assert_eq!(agent.stats().delivered, 3);
    }

    #[tokio::test]
    async fn empty_url_is_rejected() {
        let agent = agent(Arc::new(ScriptedSender::default()));
        let err = agent.trigger(event(" ", &JobId::generate(), 2)).await.unwrap_err();
        assert!(matches!(err, HookError::EmptyUrl));
    }
}
