//! Process wiring: KV backend, hook agent, lifecycle controller, worker pool,
//! controller and listeners, plus the ordered shutdown of all of them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use jobservice_auth::{Authenticator, SecretAuthenticator};
use jobservice_config::{Configuration, LoggerSink, Protocol};
use jobservice_core::{Clock, SystemClock};
use jobservice_infra::hook::HookSender;
use jobservice_infra::{
    HookAgent, HookAgentOptions, HookClient, HookError, KvError, KvStore, Keys, LcmOptions,
    LifecycleController, PoolError, PoolOptions, StatsManager, WorkerPool,
};
use jobservice_jobs::{JobRegistry, RegistryError, SAMPLE_JOB, SampleJob};
use jobservice_observability::{FileLogRetriever, LogRetriever, DEFAULT_JOB_LOG_DIR};

use crate::app::controller::{DefaultController, JobController};
use crate::metrics::{self, Metrics};
use crate::server::{self, ServerError};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("kv store unavailable: {0}")]
    Store(#[from] KvError),

    #[error("hook client: {0}")]
    Hook(#[from] HookError),

    #[error("job registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("worker pool: {0}")]
    Pool(#[from] PoolError),

    #[error("metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("backend '{0}' is not available in this build")]
    Backend(String),
}

/// Collaborators the runtime is assembled from. Production code builds them
/// from the configuration; tests substitute an in-memory store, a manual
/// clock and faster timings.
pub struct Dependencies {
    pub kv: Arc<dyn KvStore>,
    pub keys: Keys,
    pub clock: Arc<dyn Clock>,
    pub registry: JobRegistry,
    pub hook_sender: Arc<dyn HookSender>,
    pub hook_options: HookAgentOptions,
    pub pool_options: PoolOptions,
    pub lcm_options: LcmOptions,
    pub log_dir: PathBuf,
}

impl Dependencies {
    pub async fn from_config(config: &Configuration) -> Result<Self, BootstrapError> {
        let kv = connect_store(config).await?;
        let hooks = config.hook_agent;
        Ok(Self {
            kv,
            keys: Keys::new(config.worker_pool.redis_pool.namespace.clone()),
            clock: Arc::new(SystemClock),
            registry: default_registry()?,
            hook_sender: Arc::new(HookClient::new(
                jobservice_infra::hook::DELIVERY_TIMEOUT,
                jobservice_config::core_secret(),
            )?),
            hook_options: HookAgentOptions {
                max_retries: hooks.max_retries,
                ..HookAgentOptions::default()
            }
            .with_shards(hooks.shards)
            .with_drain_grace(Duration::from_secs(hooks.drain_grace_seconds)),
            pool_options: PoolOptions::default()
                .with_workers(config.worker_pool.workers)
                .with_job_loggers(config.job_loggers.clone()),
            lcm_options: LcmOptions::from_config(&config.reaper),
            log_dir: job_log_dir(config),
        })
    }
}

#[cfg(feature = "redis")]
async fn connect_store(config: &Configuration) -> Result<Arc<dyn KvStore>, BootstrapError> {
    use jobservice_infra::{RedisStore, RedisTimeouts};

    let redis = &config.worker_pool.redis_pool;
    let timeouts = RedisTimeouts {
        idle: Duration::from_secs(redis.idle_timeout_second.max(0) as u64),
        ..RedisTimeouts::default()
    };
    let store = RedisStore::connect(&redis.redis_url, timeouts).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_store(config: &Configuration) -> Result<Arc<dyn KvStore>, BootstrapError> {
    Err(BootstrapError::Backend(config.worker_pool.backend.clone()))
}

/// Registry of the job types this binary can run.
pub fn default_registry() -> Result<JobRegistry, RegistryError> {
    Ok(JobRegistry::builder()
        .register_default::<SampleJob>(SAMPLE_JOB)?
        .build())
}

/// Directory the FILE job logger writes to, which is also where logs are served from.
pub fn job_log_dir(config: &Configuration) -> PathBuf {
    config
        .job_loggers
        .iter()
        .find(|l| matches!(l.sink(), Ok(LoggerSink::File)))
        .and_then(|l| l.setting("base_dir"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_JOB_LOG_DIR))
}

/// The running job service components, without any listener.
pub struct Runtime {
    controller: Arc<dyn JobController>,
    pool: Arc<WorkerPool>,
    hooks: Arc<HookAgent>,
    cancel: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("pool", &self.pool)
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl Runtime {
    /// Start every background component. `job_loggers` drive the log sweeper.
    pub async fn start(
        deps: Dependencies,
        job_loggers: &[jobservice_config::LoggerConfig],
    ) -> Result<Self, BootstrapError> {
        let Dependencies {
            kv,
            keys,
            clock,
            registry,
            hook_sender,
            hook_options,
            pool_options,
            lcm_options,
            log_dir,
        } = deps;

        kv.ping().await?;
        let cancel = CancellationToken::new();
        let mut background = Vec::new();

        let hooks = Arc::new(HookAgent::new(
            kv.clone(),
            keys.clone(),
            clock.clone(),
            hook_sender,
            hook_options,
        ));
        hooks.start();

        let lcm = Arc::new(LifecycleController::new(
            kv.clone(),
            keys.clone(),
            clock.clone(),
            Some(hooks.clone()),
        ));
        background.push(lcm.clone().serve(lcm_options, cancel.child_token()));

        let pool = Arc::new(WorkerPool::new(
            kv.clone(),
            keys,
            clock,
            lcm.clone(),
            Arc::new(registry),
            pool_options,
        ));
        if let Err(e) = pool.start(&cancel).await {
            cancel.cancel();
            hooks.shutdown().await;
            return Err(e.into());
        }

        for logger in job_loggers {
            let Some(sweeper) = &logger.sweeper else { continue };
            let dir = sweeper
                .settings
                .get("work_dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| log_dir.clone());
            if let Some(handle) = jobservice_observability::spawn_sweeper(dir, sweeper.duration, cancel.child_token()) {
                background.push(handle);
            }
        }

        let logs: Arc<dyn LogRetriever> = Arc::new(FileLogRetriever::new(log_dir));
        let controller: Arc<dyn JobController> = Arc::new(DefaultController::new(
            pool.clone(),
            StatsManager::new(kv, lcm),
            logs,
            Some(hooks.clone()),
        ));

        info!(pool_id = %pool.pool_id(), "job service runtime started");
        Ok(Self {
            controller,
            pool,
            hooks,
            cancel,
            background,
        })
    }

    pub fn controller(&self) -> Arc<dyn JobController> {
        self.controller.clone()
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Stop workers first, interrupting running handlers so their jobs are
    /// requeued, and so final status events reach the hook agent. Then drain
    /// hooks, then the lifecycle loops.
    pub async fn shutdown(self) {
        self.pool.stop().await;
        self.hooks.shutdown().await;
        self.cancel.cancel();
        for handle in self.background {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("job service runtime stopped");
    }
}

/// Run the service until `shutdown` fires.
pub async fn run(config: Configuration, shutdown: CancellationToken) -> Result<(), BootstrapError> {
    let deps = Dependencies::from_config(&config).await?;
    let runtime = Runtime::start(deps, &config.job_loggers).await?;

    let authenticator: Arc<dyn Authenticator> = Arc::new(SecretAuthenticator::from_env());
    let app = crate::app::build_app(runtime.controller(), authenticator);

    let mut listeners: Vec<JoinHandle<Result<(), ServerError>>> = Vec::new();
    if config.metric.enabled {
        let metrics = Arc::new(Metrics::new()?);
        let router = metrics::router(&config.metric.path, metrics, runtime.controller());
        let listener = server::bind(SocketAddr::from(([0, 0, 0, 0], config.metric.port))).await?;
        listeners.push(tokio::spawn(server::serve_http(listener, router, shutdown.clone())));
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = server::bind(addr).await?;
    let served = match (config.protocol, &config.https_config) {
        (Protocol::Https, Some(https)) => {
            let tls = server::tls_config(https)?;
            server::serve_https(listener, app, tls, shutdown.clone()).await
        }
        _ => server::serve_http(listener, app, shutdown.clone()).await,
    };
    // A listener failure still tears the runtime down in order.
    shutdown.cancel();

    for handle in listeners {
        match handle.await {
            Ok(Err(e)) => warn!(error = %e, "metrics listener failed"),
            Err(e) => warn!(error = %e, "metrics listener panicked"),
            Ok(Ok(())) => {}
        }
    }
    runtime.shutdown().await;

    served.map_err(|e| {
        error!(error = %e, "api listener failed");
        e.into()
    })
}
