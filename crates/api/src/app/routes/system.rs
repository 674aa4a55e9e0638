use std::sync::Arc;

use axum::{extract::Extension, Json};

use jobservice_infra::WorkerPoolStats;

use crate::app::controller::JobController;
use crate::app::errors::ApiResult;

/// Worker pool heartbeats and counters. Served without authentication.
pub async fn stats(
    Extension(controller): Extension<Arc<dyn JobController>>,
) -> ApiResult<Json<WorkerPoolStats>> {
    Ok(Json(controller.check_status().await?))
}
