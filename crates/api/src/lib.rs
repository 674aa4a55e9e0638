//! HTTP API of the job service: routing, controller, server and process bootstrap.

pub mod app;
pub mod bootstrap;
pub mod metrics;
pub mod middleware;
pub mod server;
