//! Prometheus exposition of the worker pool and hook agent counters.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::app::controller::JobController;

pub struct Metrics {
    registry: Registry,
    jobs: IntGaugeVec,
    pools: IntGaugeVec,
    hook_events: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let jobs = IntGaugeVec::new(
            Opts::new("jobservice_jobs", "Job executions handled by this process"),
            &["outcome"],
        )?;
        registry.register(Box::new(jobs.clone()))?;

        let pools = IntGaugeVec::new(
            Opts::new("jobservice_worker_pools", "Worker pools seen in the namespace"),
            &["status"],
        )?;
        registry.register(Box::new(pools.clone()))?;

        let hook_events = IntGaugeVec::new(
            Opts::new("jobservice_hook_events", "Status hook deliveries by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(hook_events.clone()))?;

        Ok(Self {
            registry,
            jobs,
            pools,
            hook_events,
        })
    }

    /// Refresh every gauge from the controller and encode the registry.
    pub async fn render(&self, controller: &dyn JobController) -> Result<String, String> {
        let stats = controller.check_status().await.map_err(|e| e.to_string())?;
        let c = stats.counters;
        for (outcome, value) in [
            ("processed", c.processed as i64),
            ("succeeded", c.succeeded as i64),
            ("failed", c.failed as i64),
            ("retried", c.retried as i64),
            ("stopped", c.stopped as i64),
            ("running", c.running),
        ] {
            self.jobs.with_label_values(&[outcome]).set(value);
        }

        let healthy = stats
            .pools
            .iter()
            .filter(|p| p.status == jobservice_infra::worker::PoolHealth::Healthy)
            .count() as i64;
        self.pools.with_label_values(&["healthy"]).set(healthy);
        self.pools
            .with_label_values(&["dead"])
            .set(stats.pools.len() as i64 - healthy);

        if let Some(hooks) = controller.hook_stats() {
            self.hook_events
                .with_label_values(&["delivered"])
                .set(hooks.delivered as i64);
            self.hook_events
                .with_label_values(&["retried"])
                .set(hooks.retried as i64);
            self.hook_events
                .with_label_values(&["dropped"])
                .set(hooks.dropped as i64);
        }

        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

async fn scrape(
    Extension(metrics): Extension<Arc<Metrics>>,
    Extension(controller): Extension<Arc<dyn JobController>>,
) -> Response {
    match metrics.render(controller.as_ref()).await {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "metrics scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e).into_response()
        }
    }
}

/// Router serving the metrics at `path` on the metrics listener.
pub fn router(path: &str, metrics: Arc<Metrics>, controller: Arc<dyn JobController>) -> Router {
    Router::new()
        .route(path, get(scrape))
        .layer(Extension(controller))
        .layer(Extension(metrics))
}
