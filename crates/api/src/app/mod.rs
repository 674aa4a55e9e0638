//! HTTP API application wiring.
//!
//! - `controller.rs`: validation and dispatch between handlers and the worker pool
//! - `routes/`: HTTP routes and handlers
//! - `dto.rs`: request decoding helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use jobservice_auth::Authenticator;

use crate::middleware;

pub mod controller;
pub mod dto;
pub mod errors;
pub mod routes;

pub const API_PREFIX: &str = "/api/v1";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Build the full HTTP router (public entrypoint used by the server).
pub fn build_app(
    controller: Arc<dyn controller::JobController>,
    authenticator: Arc<dyn Authenticator>,
) -> Router {
    let auth_state = middleware::AuthState { authenticator };

    // Protected routes: require the shared secret.
    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::auth_middleware,
    ));

    let api = Router::new()
        .route("/stats", get(routes::system::stats))
        .merge(protected);

    Router::new()
        .nest(API_PREFIX, api)
        .layer(Extension(controller))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
}
