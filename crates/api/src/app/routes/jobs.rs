use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path, Query},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use jobservice_core::{JobPage, ServiceError};

use crate::app::controller::JobController;
use crate::app::dto::{self, JobActionRequest, PageParams};
use crate::app::errors::ApiResult;

pub const TOTAL_COUNT_HEADER: &str = "Total-Count";

pub fn router() -> Router {
    Router::new()
        .route("/", axum::routing::post(launch_job))
        .route("/scheduled", get(get_scheduled_jobs))
        .route("/:id", get(get_job).post(job_action))
        .route("/:id/log", get(get_job_log))
        .route("/:id/executions", get(get_periodic_executions))
}

pub async fn launch_job(
    Extension(controller): Extension<Arc<dyn JobController>>,
    body: Bytes,
) -> ApiResult<Response> {
    let request = dto::parse_job_request(&body)?;
    let stats = controller.launch_job(request).await?;
    Ok((StatusCode::ACCEPTED, Json(stats)).into_response())
}

pub async fn get_job(
    Extension(controller): Extension<Arc<dyn JobController>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let stats = controller.get_job(&id).await?;
    Ok(Json(stats).into_response())
}

/// `{"action": "stop"}` is the only supported action.
pub async fn job_action(
    Extension(controller): Extension<Arc<dyn JobController>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let action: JobActionRequest = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::bad_request("malformed job action body").with_cause(e))?;
    match action.action.trim().to_ascii_lowercase().as_str() {
        "stop" => {
            controller.stop_job(&id).await?;
            Ok(StatusCode::NO_CONTENT)
        }
        other => Err(ServiceError::not_implemented(format!("action '{other}' is not supported")).into()),
    }
}

pub async fn get_job_log(
    Extension(controller): Extension<Arc<dyn JobController>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    if id.contains("..") || id.contains(['/', '\\']) {
        return Err(ServiceError::bad_request(format!("invalid job id '{id}'")).into());
    }
    let data = controller.get_job_log_data(&id).await?;
    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))],
        data,
    )
        .into_response())
}

pub async fn get_periodic_executions(
    Extension(controller): Extension<Arc<dyn JobController>>,
    Path(id): Path<String>,
    Query(params): Query<PageParams>,
) -> ApiResult<Response> {
    let page = controller
        .get_periodic_executions(&id, &params.to_query())
        .await?;
    Ok(paged(page))
}

pub async fn get_scheduled_jobs(
    Extension(controller): Extension<Arc<dyn JobController>>,
    Query(params): Query<PageParams>,
) -> ApiResult<Response> {
    let page = controller.get_scheduled_jobs(&params.to_query()).await?;
    Ok(paged(page))
}

fn paged(page: JobPage) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(TOTAL_COUNT_HEADER, HeaderValue::from(page.total));
    (headers, Json(page.jobs)).into_response()
}
