//! Job kinds and the job status lattice.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// How a job is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Runs as soon as a worker is free.
    #[default]
    #[serde(alias = "Generic", alias = "GENERIC")]
    Generic,
    /// Runs once after a delay.
    #[serde(alias = "Scheduled", alias = "SCHEDULED")]
    Scheduled,
    /// Parent record of a cron policy; its executions are scheduled jobs.
    #[serde(alias = "Periodic", alias = "PERIODIC")]
    Periodic,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Scheduled => "scheduled",
            Self::Periodic => "periodic",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generic" => Ok(Self::Generic),
            "scheduled" => Ok(Self::Scheduled),
            "periodic" => Ok(Self::Periodic),
            other => Err(ServiceError::bad_request(format!("unknown job kind: {other}"))),
        }
    }
}

/// Lifecycle status of a job.
///
/// Statuses are ordered `Pending < Scheduled < Running < {Success, Error, Stopped}`.
/// A transition is accepted only when it moves strictly forward, so the three
/// terminal statuses are absorbing and never replace each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Success,
    Error,
    Stopped,
}

impl JobStatus {
    /// Position in the status order. Terminal statuses share the top rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Scheduled => 1,
            Self::Running => 2,
            Self::Success | Self::Error | Self::Stopped => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Whether `self -> next` moves strictly forward in the order.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Success => "Success",
            Self::Error => "Error",
            Self::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Scheduled" => Ok(Self::Scheduled),
            "Running" => Ok(Self::Running),
            "Success" => Ok(Self::Success),
            "Error" => Ok(Self::Error),
            "Stopped" => Ok(Self::Stopped),
            other => Err(ServiceError::bad_request(format!("unknown job status: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Scheduled,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Error,
        JobStatus::Stopped,
    ];

    #[test]
    fn terminal_statuses_are_absorbing() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be refused");
            }
        }
    }

    #[test]
    fn forward_transitions_are_accepted() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Scheduled.can_transition_to(JobStatus::Stopped));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Error));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn kinds_parse_case_insensitively() {
        assert_eq!("Generic".parse::<JobKind>().unwrap(), JobKind::Generic);
        assert_eq!("PERIODIC".parse::<JobKind>().unwrap(), JobKind::Periodic);
        assert!("cron".parse::<JobKind>().is_err());
        let kind: JobKind = serde_json::from_str("\"Scheduled\"").unwrap();
        assert_eq!(kind, JobKind::Scheduled);
    }

    #[test]
    fn status_round_trips_through_display() {
        for status in ALL {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
    }

    fn any_status() -> impl Strategy<Value = JobStatus> {
        proptest::sample::select(ALL.to_vec())
    }

    proptest! {
        #[test]
        fn accepted_sequences_never_decrease(seq in proptest::collection::vec(any_status(), 1..20)) {
            let mut current = JobStatus::Pending;
            let mut history = vec![current];
            for next in seq {
                if current.can_transition_to(next) {
                    current = next;
                    history.push(current);
                }
            }
            prop_assert!(history.windows(2).all(|w| w[0].rank() < w[1].rank()));
            prop_assert!(history.iter().filter(|s| s.is_terminal()).count() <= 1);
        }
    }
}
