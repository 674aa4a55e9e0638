//! Job identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ServiceError;

/// Longest identifier accepted from callers.
const MAX_ID_LEN: usize = 64;

/// Identifier of a job (one-shot, scheduled, periodic parent or execution).
///
/// Generated ids are 24 lowercase hex characters: a 6-byte millisecond
/// timestamp followed by 6 random bytes, so they sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a new, time-ordered identifier.
    pub fn generate() -> Self {
        // UUIDv7 lays out a 48-bit ms timestamp first and random bits last.
        let bytes = Uuid::now_v7().into_bytes();
        let mut raw = [0u8; 12];
        raw[..6].copy_from_slice(&bytes[..6]);
        raw[6..].copy_from_slice(&bytes[10..]);
        Self(hex::encode(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = ServiceError;

    /// Accepts ids made of ASCII letters, digits, `_` and `-`.
    ///
    /// Anything else (path separators, dots, whitespace) is rejected so an id
    /// can never escape the job log directory.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > MAX_ID_LEN {
            return Err(ServiceError::bad_request(format!(
                "invalid job id length: {}",
                s.len()
            )));
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(ServiceError::bad_request(format!(
                "invalid characters in job id: {s}"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_24_hex_chars() {
        let id = JobId::generate();
        assert_eq!(id.as_str().len(), 24);
        assert!(id.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn path_like_ids_are_rejected() {
        for bad in ["../etc/passwd", "a/b", "a\\b", "..", "", "has space"] {
            assert!(bad.parse::<JobId>().is_err(), "{bad} should be rejected");
        }
        assert!("fake_job_ID-1".parse::<JobId>().is_ok());
    }
}
