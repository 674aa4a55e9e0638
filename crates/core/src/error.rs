//! Service error model.
//!
//! Every failure that can reach a caller of the job service is expressed as a
//! [`ServiceError`] carrying an [`ErrorKind`]. The kind decides the HTTP status
//! code, which doubles as the numeric `code` of JSON error bodies.

use serde::Serialize;
use thiserror::Error;

/// Result type used across the service layer.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Classification of a service failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Malformed input: bad JSON, unknown job name, invalid cron, bad id.
    BadRequest,
    /// Missing or wrong shared secret.
    Unauthorized,
    /// The referenced job (or its log) does not exist.
    NotFound,
    /// A uniqueness lock is held or a status change lost a race.
    Conflict,
    /// The requested action is not supported.
    NotImplemented,
    /// KV failure, serialization failure or anything unexpected.
    Internal,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::NotImplemented => 501,
            Self::Internal => 500,
        }
    }

    /// Numeric code written into JSON error bodies; mirrors the HTTP status.
    pub fn code(self) -> u16 {
        self.http_status()
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::NotImplemented => "not_implemented",
            Self::Internal => "internal_error",
        }
    }
}

/// A failure surfaced to callers of the job service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ServiceError {
    kind: ErrorKind,
    message: String,
    cause: Option<String>,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotImplemented, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    /// Attach the underlying cause, reported as `details` in error bodies.
    pub fn with_cause(mut self, cause: impl ToString) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    pub fn code(&self) -> u16 {
        self.kind.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_http_statuses() {
        assert_eq!(ServiceError::bad_request("x").http_status(), 400);
        assert_eq!(ServiceError::unauthorized("x").http_status(), 401);
        assert_eq!(ServiceError::not_found("x").http_status(), 404);
        assert_eq!(ServiceError::conflict("x").http_status(), 409);
        assert_eq!(ServiceError::not_implemented("x").http_status(), 501);
        assert_eq!(ServiceError::internal("x").http_status(), 500);
    }

    #[test]
    fn cause_is_kept_apart_from_message() {
        let err = ServiceError::internal("save job stats").with_cause("connection refused");
        assert_eq!(err.to_string(), "save job stats");
        assert_eq!(err.cause(), Some("connection refused"));
        assert_eq!(err.code(), 500);
        assert_eq!(err.kind().label(), "internal_error");
    }
}
