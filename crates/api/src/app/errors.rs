use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use jobservice_core::ServiceError;

/// JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub code: u16,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<&'a str>,
}

/// A [`ServiceError`] on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, cause = ?self.0.cause(), "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self.0, "request rejected");
        }
        json_error(status, self.0.message(), self.0.cause())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn json_error(status: StatusCode, message: &str, details: Option<&str>) -> Response {
    (
        status,
        axum::Json(ErrorBody {
            code: status.as_u16(),
            message,
            details,
        }),
    )
        .into_response()
}
