//! HTTP delivery of status hook payloads.

use std::time::Duration;

use async_trait::async_trait;
use jobservice_auth::SECRET_SCHEME;
use jobservice_core::HookPayload;
use reqwest::StatusCode;

use super::HookError;

/// Per-attempt timeout of a hook POST.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// What to do with an event after one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// 2xx response.
    Delivered(u16),
    /// 408, 429, 5xx or a transport error.
    Retry(String),
    /// Any other status; retrying cannot help.
    Drop(u16),
}

/// Classify a hook endpoint's response status.
pub fn classify(status: StatusCode) -> Delivery {
    let code = status.as_u16();
    if status.is_success() {
        Delivery::Delivered(code)
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Delivery::Retry(format!("hook endpoint answered {code}"))
    } else {
        Delivery::Drop(code)
    }
}

/// Sends one payload to one URL.
#[async_trait]
pub trait HookSender: Send + Sync {
    async fn send(&self, url: &str, payload: &HookPayload) -> Delivery;
}

/// `reqwest`-backed sender. Adds `Authorization: Harbor-Secret <secret>`
/// when a core secret is configured.
#[derive(Clone)]
pub struct HookClient {
    http: reqwest::Client,
    secret: Option<String>,
}

impl std::fmt::Debug for HookClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookClient")
            .field("authorized", &self.secret.is_some())
            .finish()
    }
}

impl HookClient {
    pub fn new(timeout: Duration, core_secret: Option<String>) -> Result<Self, HookError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("jobservice/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HookError::Client(e.to_string()))?;
        Ok(Self {
            http,
            secret: core_secret.filter(|s| !s.is_empty()),
        })
    }
}

#[async_trait]
impl HookSender for HookClient {
    async fn send(&self, url: &str, payload: &HookPayload) -> Delivery {
        let mut request = self.http.post(url).json(payload);
        if let Some(secret) = &self.secret {
            request = request.header(
                reqwest::header::AUTHORIZATION,
                format!("{SECRET_SCHEME} {secret}"),
            );
        }
        match request.send().await {
            Ok(response) => classify(response.status()),
            Err(e) => Delivery::Retry(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_map_to_delivery_decisions() {
        assert_eq!(classify(StatusCode::OK), Delivery::Delivered(200));
        assert_eq!(classify(StatusCode::NO_CONTENT), Delivery::Delivered(204));
        assert!(matches!(classify(StatusCode::REQUEST_TIMEOUT), Delivery::Retry(_)));
        assert!(matches!(classify(StatusCode::TOO_MANY_REQUESTS), Delivery::Retry(_)));
        assert!(matches!(classify(StatusCode::BAD_GATEWAY), Delivery::Retry(_)));
        assert_eq!(classify(StatusCode::NOT_FOUND), Delivery::Drop(404));
        assert_eq!(classify(StatusCode::UNAUTHORIZED), Delivery::Drop(401));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_retried() {
        let client = HookClient::new(Duration::from_millis(200), None).unwrap();
        let payload = HookPayload {
            event: "status_change".to_string(),
            job_id: jobservice_core::JobId::generate(),
            status: jobservice_core::JobStatus::Running,
            check_in: None,
            metadata: None,
            revision: 2,
            timestamp: 0,
        };
        let outcome = client.send("http://127.0.0.1:1/hook", &payload).await;
        assert!(matches!(outcome, Delivery::Retry(_)));
    }
}
