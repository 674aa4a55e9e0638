//! The job controller: request validation and dispatch between the HTTP
//! handlers and the worker pool.

use std::sync::Arc;

use async_trait::async_trait;
use jobservice_core::{
    JobCursorPage, JobId, JobPage, JobRequest, JobStats, Launch, PageQuery, ServiceError,
    ServiceResult,
};
use jobservice_infra::hook::HookStats;
use jobservice_infra::{HookAgent, StatsManager, StopOutcome, WorkerPool, WorkerPoolStats};
use jobservice_jobs::JobRegistry;
use jobservice_observability::{LogError, LogRetriever};
use tracing::info;

/// Everything the API can ask of the job service.
#[async_trait]
pub trait JobController: Send + Sync {
    async fn launch_job(&self, request: JobRequest) -> ServiceResult<JobStats>;
    async fn get_job(&self, job_id: &str) -> ServiceResult<JobStats>;
    async fn stop_job(&self, job_id: &str) -> ServiceResult<StopOutcome>;
    async fn retry_job(&self, job_id: &str) -> ServiceResult<JobStats>;
    async fn check_status(&self) -> ServiceResult<WorkerPoolStats>;
    async fn get_job_log_data(&self, job_id: &str) -> ServiceResult<Vec<u8>>;
    async fn get_periodic_executions(&self, job_id: &str, query: &PageQuery) -> ServiceResult<JobPage>;
    async fn get_scheduled_jobs(&self, query: &PageQuery) -> ServiceResult<JobPage>;
    async fn get_jobs(&self, cursor: u64, page_size: usize) -> ServiceResult<JobCursorPage>;
    /// Delivery counters of the hook agent, when one runs.
    fn hook_stats(&self) -> Option<HookStats>;
}

pub struct DefaultController {
    pool: Arc<WorkerPool>,
    manager: StatsManager,
    registry: Arc<JobRegistry>,
    logs: Arc<dyn LogRetriever>,
    hooks: Option<Arc<HookAgent>>,
}

impl DefaultController {
    pub fn new(
        pool: Arc<WorkerPool>,
        manager: StatsManager,
        logs: Arc<dyn LogRetriever>,
        hooks: Option<Arc<HookAgent>>,
    ) -> Self {
        let registry = pool.registry().clone();
        Self {
            pool,
            manager,
            registry,
            logs,
            hooks,
        }
    }
}

fn parse_id(raw: &str) -> ServiceResult<JobId> {
    raw.parse()
        .map_err(|_| ServiceError::bad_request(format!("invalid job id '{raw}'")))
}

#[async_trait]
impl JobController for DefaultController {
    async fn launch_job(&self, request: JobRequest) -> ServiceResult<JobStats> {
        let launch = request.validate()?;
        let descriptor = self.registry.is_known(&request.name).ok_or_else(|| {
            ServiceError::bad_request(format!("job with name '{}' is unknown", request.name))
        })?;
        self.registry
            .validate_parameters(descriptor, &request.parameters)
            .map_err(|e| ServiceError::bad_request(format!("invalid job parameters: {e}")))?;

        let hook = request.hook_url().map(str::to_string);
        let unique = request.metadata.is_unique;
        let name = request.name.as_str();
        let params = request.parameters.clone();
        let stats = match launch {
            Launch::Now => self.pool.enqueue(name, params, unique, hook).await?,
            Launch::Delayed { delay_seconds } => {
                self.pool
                    .schedule(name, params, delay_seconds, unique, hook)
                    .await?
            }
            Launch::Periodic { cron } => {
                self.pool
                    .periodically_enqueue(name, params, &cron, unique, hook)
                    .await?
            }
        };
        info!(job_id = %stats.id, job_name = %stats.name, kind = %stats.kind, "job submitted");
        Ok(stats)
    }

    async fn get_job(&self, job_id: &str) -> ServiceResult<JobStats> {
        Ok(self.manager.get_job(&parse_id(job_id)?).await?)
    }

    async fn stop_job(&self, job_id: &str) -> ServiceResult<StopOutcome> {
        let id = parse_id(job_id)?;
        let outcome = self.pool.stop_job(&id).await?;
        info!(job_id = %id, ?outcome, "stop requested");
        Ok(outcome)
    }

    async fn retry_job(&self, job_id: &str) -> ServiceResult<JobStats> {
        Ok(self.pool.retry_job(&parse_id(job_id)?).await?)
    }

    async fn check_status(&self) -> ServiceResult<WorkerPoolStats> {
        Ok(self.pool.stats().await?)
    }

    async fn get_job_log_data(&self, job_id: &str) -> ServiceResult<Vec<u8>> {
        self.logs.retrieve(job_id).await.map_err(|e| match e {
            LogError::InvalidId(_) => ServiceError::bad_request(e.to_string()),
            LogError::NotFound(_) => ServiceError::not_found(e.to_string()),
            LogError::Io { .. } => ServiceError::internal("failed to read job log").with_cause(e),
        })
    }

    async fn get_periodic_executions(&self, job_id: &str, query: &PageQuery) -> ServiceResult<JobPage> {
        Ok(self
            .manager
            .get_periodic_executions(&parse_id(job_id)?, query)
            .await?)
    }

    async fn get_scheduled_jobs(&self, query: &PageQuery) -> ServiceResult<JobPage> {
        Ok(self.manager.get_scheduled_jobs(query).await?)
    }

    async fn get_jobs(&self, cursor: u64, page_size: usize) -> ServiceResult<JobCursorPage> {
        Ok(self.manager.get_jobs(cursor, page_size).await?)
    }

    fn hook_stats(&self) -> Option<HookStats> {
        self.hooks.as_ref().map(|agent| agent.stats())
    }
}
