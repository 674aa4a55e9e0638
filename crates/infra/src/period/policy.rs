use chrono::{DateTime, Utc};
use jobservice_core::{CronSpec, JobId, Parameters};
use serde::{Deserialize, Serialize};

use super::SchedulerError;

/// A stored periodic policy, keyed by its parent job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: JobId,
    pub job_name: String,
    pub cron_spec: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_hook: Option<String>,
    pub created_at: i64,
}

impl Policy {
    pub fn cron(&self) -> Result<CronSpec, SchedulerError> {
        CronSpec::parse(&self.cron_spec).map_err(|e| SchedulerError::InvalidCron {
            expr: self.cron_spec.clone(),
            reason: e.message().to_string(),
        })
    }

    /// Next firing strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Result<i64, SchedulerError> {
        self.cron()?
            .next_after(now)
            .map(|at| at.timestamp())
            .ok_or_else(|| SchedulerError::InvalidCron {
                expr: self.cron_spec.clone(),
                reason: "expression never fires again".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(expr: &str) -> Policy {
        Policy {
            id: JobId::generate(),
            job_name: "SAMPLE".into(),
            cron_spec: expr.into(),
            parameters: Parameters::new(),
            is_unique: false,
            status_hook: None,
            created_at: 0,
        }
    }

    #[test]
    fn next_fire_is_computed_from_the_expression() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 1, 0).unwrap();
        let next = policy("0 */5 * * * *").next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 8, 5, 0).unwrap().timestamp());
    }

    #[test]
    fn broken_expression_is_reported() {
        let err = policy("* * *").cron().unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
    }

    #[test]
    fn policy_json_round_trips() {
        let p = policy("0 0 * * * *");
        let raw = serde_json::to_string(&p).unwrap();
        assert_eq!(serde_json::from_str::<Policy>(&raw).unwrap(), p);
    }
}
