//! Job submission requests.

use serde::{Deserialize, Serialize};

use crate::cron::CronSpec;
use crate::error::{ServiceError, ServiceResult};
use crate::params::Parameters;
use crate::status::JobKind;

/// Scheduling metadata of a submitted job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(default)]
    pub kind: JobKind,
    /// Delay before a scheduled job runs.
    #[serde(
        default,
        alias = "schedule_delay",
        skip_serializing_if = "Option::is_none"
    )]
    pub schedule_delay_seconds: Option<u64>,
    /// Cron expression of a periodic job.
    #[serde(default, alias = "cron_spec", skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, alias = "unique")]
    pub is_unique: bool,
}

/// A request to run a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub metadata: JobMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_hook: Option<String>,
}

/// What a validated request asks the worker pool to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Launch {
    Now,
    Delayed { delay_seconds: u64 },
    Periodic { cron: CronSpec },
}

impl JobRequest {
    pub fn new(name: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            name: name.into(),
            parameters,
            metadata: JobMetadata::default(),
            status_hook: None,
        }
    }

    /// The hook URL, with an empty string treated as absent.
    pub fn hook_url(&self) -> Option<&str> {
        self.status_hook
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Check the shape of the request and decide how it is launched.
    ///
    /// Parameter validation against the registered handler happens later, in
    /// the controller, once the job name is resolved.
    pub fn validate(&self) -> ServiceResult<Launch> {
        if self.name.trim().is_empty() {
            return Err(ServiceError::bad_request("job name is required"));
        }

        if let Some(hook) = self.hook_url() {
            let parsed = url::Url::parse(hook).map_err(|e| {
                ServiceError::bad_request(format!("invalid status hook url '{hook}'")).with_cause(e)
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ServiceError::bad_request(format!(
                    "status hook must be an http(s) url: '{hook}'"
                )));
            }
        }

        match self.metadata.kind {
            JobKind::Generic => Ok(Launch::Now),
            JobKind::Scheduled => match self.metadata.schedule_delay_seconds {
                Some(delay) if delay > 0 => Ok(Launch::Delayed {
                    delay_seconds: delay,
                }),
                _ => Err(ServiceError::bad_request(
                    "scheduled job requires a positive schedule_delay_seconds",
                )),
            },
            JobKind::Periodic => {
                let expr = self
                    .metadata
                    .cron
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| ServiceError::bad_request("periodic job requires a cron spec"))?;
                Ok(Launch::Periodic {
                    cron: CronSpec::parse(expr)?,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn request(json: &str) -> JobRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn generic_request_defaults() {
        let req = request(r#"{"name":"SAMPLE","parameters":{"image":"busybox"}}"#);
        assert_eq!(req.metadata.kind, JobKind::Generic);
        assert_eq!(req.validate().unwrap(), Launch::Now);
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let req = request(
            r#"{"name":"SAMPLE","metadata":{"kind":"Scheduled","schedule_delay":30,"unique":true}}"#,
        );
        assert!(req.metadata.is_unique);
        assert_eq!(req.validate().unwrap(), Launch::Delayed { delay_seconds: 30 });
    }

    #[test]
    fn scheduled_without_positive_delay_is_rejected() {
        let req = request(r#"{"name":"SAMPLE","metadata":{"kind":"scheduled","schedule_delay_seconds":0}}"#);
        assert_eq!(req.validate().unwrap_err().kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn periodic_needs_a_valid_cron() {
        let ok = request(r#"{"name":"SAMPLE","metadata":{"kind":"periodic","cron":"0 */5 * * * *"}}"#);
        assert!(matches!(ok.validate().unwrap(), Launch::Periodic { .. }));

        let missing = request(r#"{"name":"SAMPLE","metadata":{"kind":"periodic"}}"#);
        assert!(missing.validate().is_err());

        let bad = request(r#"{"name":"SAMPLE","metadata":{"kind":"periodic","cron_spec":"*/5 * * * *"}}"#);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn hook_must_be_http() {
        let mut req = JobRequest::new("SAMPLE", Parameters::new());
        req.status_hook = Some("ftp://example.com/hook".to_string());
        assert!(req.validate().is_err());

        req.status_hook = Some("".to_string());
        assert!(req.hook_url().is_none());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn blank_name_is_rejected() {
        let req = JobRequest::new("  ", Parameters::new());
        assert!(req.validate().is_err());
    }
}
