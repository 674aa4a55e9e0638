//! Persisted job records and status change notifications.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::JobId;
use crate::params::Parameters;
use crate::status::{JobKind, JobStatus};

/// The authoritative record of a job, stored as a hash in the KV store.
///
/// Timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub id: JobId,
    pub name: String,
    pub kind: JobKind,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_hook: Option<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<i64>,
    pub enqueue_time: i64,
    pub update_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_job_id: Option<JobId>,
    pub ref_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in_at: Option<i64>,
    pub revision: u64,
    /// Failed attempts so far; drives handler retries.
    #[serde(default)]
    pub fails: u32,
}

/// Failure to rebuild a [`JobStats`] from its stored fields.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StatsDecodeError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid value for field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

pub mod field {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const KIND: &str = "kind";
    pub const PARAMETERS: &str = "parameters";
    pub const UNIQUE: &str = "unique";
    pub const STATUS_HOOK: &str = "web_hook_url";
    pub const STATUS: &str = "status";
    pub const RUN_AT: &str = "run_at";
    pub const ENQUEUE_TIME: &str = "enqueue_time";
    pub const UPDATE_TIME: &str = "update_time";
    pub const CRON_SPEC: &str = "cron_spec";
    pub const UPSTREAM_JOB_ID: &str = "upstream_job_id";
    pub const REF_LINK: &str = "ref_link";
    pub const CHECK_IN: &str = "check_in";
    pub const CHECK_IN_AT: &str = "check_in_at";
    pub const REVISION: &str = "revision";
    pub const FAILS: &str = "fails";
}

impl JobStats {
    /// A fresh record in `Pending` at revision 1.
    pub fn new(id: JobId, name: impl Into<String>, kind: JobKind, now: i64) -> Self {
        let ref_link = Self::ref_link_for(&id);
        Self {
            id,
            name: name.into(),
            kind,
            parameters: Parameters::new(),
            is_unique: false,
            status_hook: None,
            status: JobStatus::Pending,
            run_at: None,
            enqueue_time: now,
            update_time: now,
            cron_spec: None,
            upstream_job_id: None,
            ref_link,
            check_in: None,
            check_in_at: None,
            revision: 1,
            fails: 0,
        }
    }

    pub fn ref_link_for(id: &JobId) -> String {
        format!("/api/v1/jobs/{id}")
    }

    pub fn hook_url(&self) -> Option<&str> {
        self.status_hook.as_deref().filter(|u| !u.trim().is_empty())
    }

    /// Flatten into hash fields. Absent optionals are omitted.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (field::ID.to_string(), self.id.to_string()),
            (field::NAME.to_string(), self.name.clone()),
            (field::KIND.to_string(), self.kind.to_string()),
            (
                field::PARAMETERS.to_string(),
                serde_json::Value::Object(self.parameters.clone()).to_string(),
            ),
            (field::UNIQUE.to_string(), self.is_unique.to_string()),
            (field::STATUS.to_string(), self.status.to_string()),
            (field::ENQUEUE_TIME.to_string(), self.enqueue_time.to_string()),
            (field::UPDATE_TIME.to_string(), self.update_time.to_string()),
            (field::REF_LINK.to_string(), self.ref_link.clone()),
            (field::REVISION.to_string(), self.revision.to_string()),
            (field::FAILS.to_string(), self.fails.to_string()),
        ];
        let optional = [
            (field::STATUS_HOOK, self.status_hook.clone()),
            (field::RUN_AT, self.run_at.map(|v| v.to_string())),
            (field::CRON_SPEC, self.cron_spec.clone()),
            (
                field::UPSTREAM_JOB_ID,
                self.upstream_job_id.as_ref().map(|v| v.to_string()),
            ),
            (field::CHECK_IN, self.check_in.clone()),
            (field::CHECK_IN_AT, self.check_in_at.map(|v| v.to_string())),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                fields.push((name.to_string(), value));
            }
        }
        fields
    }

    /// Rebuild from hash fields written by [`JobStats::to_fields`].
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, StatsDecodeError> {
        let required = |name: &'static str| {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or(StatsDecodeError::MissingField(name))
        };
        let optional = |name: &'static str| {
            fields
                .get(name)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
        };
        let invalid = |field: &'static str, reason: String| StatsDecodeError::InvalidField {
            field,
            reason,
        };
        let int = |name: &'static str, raw: &str| {
            raw.parse::<i64>().map_err(|e| invalid(name, e.to_string()))
        };

        let id = required(field::ID)?
            .parse::<JobId>()
            .map_err(|e| invalid(field::ID, e.to_string()))?;
        let kind = required(field::KIND)?
            .parse::<JobKind>()
            .map_err(|e| invalid(field::KIND, e.to_string()))?;
        let status = required(field::STATUS)?
            .parse::<JobStatus>()
            .map_err(|e| invalid(field::STATUS, e.to_string()))?;
        let parameters = match optional(field::PARAMETERS) {
            Some(raw) => serde_json::from_str::<Parameters>(raw)
                .map_err(|e| invalid(field::PARAMETERS, e.to_string()))?,
            None => Parameters::new(),
        };
        let upstream_job_id = optional(field::UPSTREAM_JOB_ID)
            .map(|raw| {
                raw.parse::<JobId>()
                    .map_err(|e| invalid(field::UPSTREAM_JOB_ID, e.to_string()))
            })
            .transpose()?;

        Ok(Self {
            ref_link: optional(field::REF_LINK)
                .map(str::to_string)
                .unwrap_or_else(|| Self::ref_link_for(&id)),
            id,
            name: required(field::NAME)?.to_string(),
            kind,
            parameters,
            is_unique: optional(field::UNIQUE) == Some("true"),
            status_hook: optional(field::STATUS_HOOK).map(str::to_string),
            status,
            run_at: optional(field::RUN_AT)
                .map(|v| int(field::RUN_AT, v))
                .transpose()?,
            enqueue_time: int(field::ENQUEUE_TIME, required(field::ENQUEUE_TIME)?)?,
            update_time: int(field::UPDATE_TIME, required(field::UPDATE_TIME)?)?,
            cron_spec: optional(field::CRON_SPEC).map(str::to_string),
            upstream_job_id,
            check_in: optional(field::CHECK_IN).map(str::to_string),
            check_in_at: optional(field::CHECK_IN_AT)
                .map(|v| int(field::CHECK_IN_AT, v))
                .transpose()?,
            revision: required(field::REVISION)?
                .parse::<u64>()
                .map_err(|e| invalid(field::REVISION, e.to_string()))?,
            fails: optional(field::FAILS)
                .map(|v| v.parse::<u32>().map_err(|e| invalid(field::FAILS, e.to_string())))
                .transpose()?
                .unwrap_or(0),
        })
    }
}

/// A status change (or check-in) to deliver to a job's status hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JobStats>,
    pub revision: u64,
}

/// A queued hook delivery together with its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    pub url: String,
    /// Unix seconds at which the change happened.
    pub timestamp: i64,
    pub change: StatusChange,
    pub retries_remaining: u32,
    #[serde(default)]
    pub attempts: u32,
    /// Unix milliseconds before which the event must not be sent.
    #[serde(default)]
    pub next_attempt_at_ms: i64,
}

/// The JSON body POSTed to a status hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookPayload {
    pub event: String,
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JobStats>,
    pub revision: u64,
    pub timestamp: i64,
}

impl HookEvent {
    pub fn new(url: impl Into<String>, change: StatusChange, timestamp: i64, max_retries: u32) -> Self {
        Self {
            url: url.into(),
            timestamp,
            change,
            retries_remaining: max_retries,
            attempts: 0,
            next_attempt_at_ms: 0,
        }
    }

    pub fn payload(&self) -> HookPayload {
        HookPayload {
            event: "status_change".to_string(),
            job_id: self.change.job_id.clone(),
            status: self.change.status,
            check_in: self.change.check_in.clone(),
            metadata: self.change.metadata.clone(),
            revision: self.change.revision,
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> JobStats {
        let mut stats = JobStats::new(JobId::generate(), "SAMPLE", JobKind::Scheduled, 1_700_000_000);
        stats.parameters = json!({"image": "busybox"}).as_object().cloned().unwrap();
        stats.run_at = Some(1_700_000_060);
        stats.status = JobStatus::Scheduled;
        stats.status_hook = Some("http://hooks.local/job".to_string());
        stats
    }

    #[test]
    fn fields_rebuild_the_same_record() {
        let stats = sample();
        let map: HashMap<String, String> = stats.to_fields().into_iter().collect();
        assert_eq!(JobStats::from_fields(&map).unwrap(), stats);
    }

    #[test]
    fn absent_optionals_are_not_written() {
        let stats = JobStats::new(JobId::generate(), "SAMPLE", JobKind::Generic, 1);
        let names: Vec<String> = stats.to_fields().into_iter().map(|(k, _)| k).collect();
        assert!(!names.iter().any(|n| n == field::CHECK_IN));
        assert!(!names.iter().any(|n| n == field::RUN_AT));
        assert_eq!(stats.ref_link, format!("/api/v1/jobs/{}", stats.id));
    }

    #[test]
    fn missing_status_is_reported() {
        let mut map: HashMap<String, String> = sample().to_fields().into_iter().collect();
        map.remove(field::STATUS);
        assert_eq!(
            JobStats::from_fields(&map).unwrap_err(),
            StatsDecodeError::MissingField(field::STATUS)
        );
    }

    #[test]
    fn hook_payload_is_flat() {
        let stats = sample();
        let change = StatusChange {
            job_id: stats.id.clone(),
            status: JobStatus::Running,
            check_in: None,
            metadata: None,
            revision: 2,
        };
        let event = HookEvent::new("http://hooks.local/job", change, 42, 10);
        let body = serde_json::to_value(event.payload()).unwrap();
        assert_eq!(body["event"], "status_change");
        assert_eq!(body["status"], "Running");
        assert_eq!(body["revision"], 2);
        assert!(body.get("check_in").is_none());
    }
}
