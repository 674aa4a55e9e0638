use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::Response,
};

use jobservice_auth::{AuthError, Authenticator};

use crate::app::errors::json_error;

#[derive(Clone)]
pub struct AuthState {
    pub authenticator: Arc<dyn Authenticator>,
}

/// Rejects requests without a valid `Authorization: Harbor-Secret <token>`.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .map(|value| value.to_str().map_err(|_| AuthError::MalformedScheme));
    let verdict = match header {
        Some(Err(e)) => Err(e),
        Some(Ok(value)) => state.authenticator.authenticate(Some(value)),
        None => state.authenticator.authenticate(None),
    };

    match verdict {
        Ok(()) => next.run(req).await,
        Err(e) => {
            tracing::warn!(
                method = %req.method(),
                path = %req.uri().path(),
                reason = %e,
                "unauthorized request"
            );
            json_error(StatusCode::UNAUTHORIZED, &e.to_string(), None)
        }
    }
}
