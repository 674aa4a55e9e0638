//! Six-field cron expressions (`sec min hour day month weekday`).

use chrono::{DateTime, Duration, Utc};
use core::str::FromStr;

use crate::error::ServiceError;

/// A parsed cron expression evaluated in UTC.
#[derive(Debug, Clone)]
pub struct CronSpec {
    expr: String,
    schedule: ::cron::Schedule,
}

impl CronSpec {
    pub fn parse(expr: &str) -> Result<Self, ServiceError> {
        let trimmed = expr.trim();
        let fields = trimmed.split_whitespace().count();
        if fields != 6 {
            return Err(ServiceError::bad_request(format!(
                "cron expression must have 6 fields, got {fields}: '{trimmed}'"
            )));
        }
        let schedule = ::cron::Schedule::from_str(trimmed).map_err(|e| {
            ServiceError::bad_request(format!("invalid cron expression '{trimmed}'")).with_cause(e)
        })?;
        Ok(Self {
            expr: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire instant strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&t).next()
    }

    /// Gap between the fire instant `at` and the one that follows it.
    pub fn period_at(&self, at: DateTime<Utc>) -> Option<Duration> {
        self.next_after(at).map(|next| next - at)
    }
}

impl FromStr for CronSpec {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for CronSpec {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn five_field_expressions_are_rejected() {
        assert!(CronSpec::parse("*/5 * * * *").is_err());
        assert!(CronSpec::parse("not a cron").is_err());
    }

    #[test]
    fn next_after_is_strictly_later() {
        let spec = CronSpec::parse("0 */5 * * * *").unwrap();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let next = spec.next_after(t).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 12, 5, 0).unwrap());
        assert_eq!(spec.period_at(next).unwrap(), Duration::minutes(5));
    }

    proptest! {
        #[test]
        fn next_after_is_deterministic(offset in 0i64..10_000_000) {
            let spec = CronSpec::parse("30 * * * * *").unwrap();
            let t = Utc.timestamp_opt(1_700_000_000 + offset, 0).unwrap();
            let a = spec.next_after(t).unwrap();
            let b = spec.next_after(t).unwrap();
            prop_assert_eq!(a, b);
            prop_assert!(a > t);
            prop_assert!(a - t <= Duration::minutes(1));
        }
    }
}
