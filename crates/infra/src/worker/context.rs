use std::sync::Arc;

use async_trait::async_trait;
use jobservice_core::{JobId, Parameters};
use jobservice_jobs::{ContextError, JobContext, OpCommand, Params};
use jobservice_observability::JobLogger;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::dispatch::IN_PROGRESS_OP;
use crate::kv::{KvStore, Keys};
use crate::tracker::Tracker;

/// The context a worker hands to a running handler.
pub struct WorkerJobContext {
    job_id: JobId,
    tracker: Arc<Mutex<Tracker>>,
    kv: Arc<dyn KvStore>,
    keys: Keys,
    cancel: CancellationToken,
    logger: JobLogger,
    params: Parameters,
}

impl WorkerJobContext {
    pub fn new(
        tracker: Arc<Mutex<Tracker>>,
        job_id: JobId,
        params: Parameters,
        kv: Arc<dyn KvStore>,
        keys: Keys,
        cancel: CancellationToken,
        logger: JobLogger,
    ) -> Self {
        Self {
            job_id,
            tracker,
            kv,
            keys,
            cancel,
            logger,
            params,
        }
    }
}

#[async_trait]
impl JobContext for WorkerJobContext {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    fn system_cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn check_in(&self, message: &str) -> Result<(), ContextError> {
        self.logger.info(format_args!("check in: {message}"));
        self.tracker
            .lock()
            .await
            .check_in(message)
            .await
            .map(|_| ())
            .map_err(|e| ContextError::CheckIn(e.to_string()))
    }

    async fn op_command(&self) -> Option<OpCommand> {
        let key = self.keys.in_progress(self.job_id.as_str());
        match self.kv.hget(&key, IN_PROGRESS_OP).await {
            Ok(raw) => raw.as_deref().and_then(OpCommand::parse),
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "failed to read op command");
                None
            }
        }
    }

    fn logger(&self) -> &JobLogger {
        &self.logger
    }

    fn params(&self) -> Params<'_> {
        Params::new(&self.params)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use jobservice_core::{JobKind, JobStats, ManualClock};

    use super::*;
    use crate::kv::InMemoryStore;

    async fn context(kv: Arc<InMemoryStore>) -> WorkerJobContext {
        let keys = Keys::new("t");
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        let stats = JobStats::new(JobId::generate(), "SAMPLE", JobKind::Generic, 1_717_200_000);
        let job_id = stats.id.clone();
        let mut tracker = Tracker::new(kv.clone(), keys.clone(), clock, stats, None);
        tracker.save().await.unwrap();
        WorkerJobContext::new(
            Arc::new(Mutex::new(tracker)),
            job_id.clone(),
            Parameters::new(),
            kv,
            keys,
            CancellationToken::new(),
            JobLogger::noop(job_id.as_str()),
        )
    }

    #[tokio::test]
    async fn blank_check_in_is_rejected() {
        let ctx = context(Arc::new(InMemoryStore::new())).await;
        let err = ctx.check_in("  ").await.unwrap_err();
        assert!(matches!(err, ContextError::CheckIn(_)));
        ctx.check_in("step 1/3").await.unwrap();
    }

    #[tokio::test]
    async fn op_command_reads_the_in_progress_flag() {
        let kv = Arc::new(InMemoryStore::new());
        let ctx = context(kv.clone()).await;
        assert_eq!(ctx.op_command().await, None);

        let key = Keys::new("t").in_progress(ctx.job_id().as_str());
        kv.hset(&key, &[(IN_PROGRESS_OP.to_string(), "stop".to_string())])
            .await
            .unwrap();
        assert_eq!(ctx.op_command().await, Some(OpCommand::Stop));

        kv.hset(&key, &[(IN_PROGRESS_OP.to_string(), "pause".to_string())])
            .await
            .unwrap();
        assert_eq!(ctx.op_command().await, None);
    }
}
