use subtle::ConstantTimeEq;
use thiserror::Error;

/// Scheme prefix of the `Authorization` header: `Harbor-Secret <token>`.
pub const SECRET_SCHEME: &str = "Harbor-Secret";

/// Name of the environment variable holding the expected secret.
pub const SECRET_ENV: &str = "JOBSERVICE_SECRET";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    Missing,

    #[error("authorization header must use the {SECRET_SCHEME} scheme")]
    MalformedScheme,

    #[error("invalid secret")]
    InvalidSecret,

    #[error("no secret configured for the job service")]
    NotConfigured,
}

/// Decides whether a request may reach the job endpoints.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, authorization: Option<&str>) -> Result<(), AuthError>;
}

/// Extract the token from `Harbor-Secret <token>`.
pub fn parse_authorization(header: &str) -> Result<&str, AuthError> {
    let header = header.trim();
    let (scheme, token) = header.split_once(' ').ok_or(AuthError::MalformedScheme)?;
    if scheme != SECRET_SCHEME {
        return Err(AuthError::MalformedScheme);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::InvalidSecret);
    }
    Ok(token)
}

/// Compares the presented token against one expected secret in constant time.
///
/// With no (or an empty) secret configured every request is refused.
#[derive(Clone)]
pub struct SecretAuthenticator {
    expected: Option<String>,
}

impl SecretAuthenticator {
    pub fn new(expected: Option<String>) -> Self {
        Self {
            expected: expected.filter(|s| !s.is_empty()),
        }
    }

    /// Read the expected secret from `JOBSERVICE_SECRET`.
    pub fn from_env() -> Self {
        let secret = std::env::var(SECRET_ENV).ok();
        if secret.as_deref().is_none_or(str::is_empty) {
            tracing::warn!(env = SECRET_ENV, "no job service secret configured, all job requests will be rejected");
        }
        Self::new(secret)
    }
}

impl std::fmt::Debug for SecretAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretAuthenticator")
            .field("configured", &self.expected.is_some())
            .finish()
    }
}

impl Authenticator for SecretAuthenticator {
    fn authenticate(&self, authorization: Option<&str>) -> Result<(), AuthError> {
        let expected = self.expected.as_deref().ok_or(AuthError::NotConfigured)?;
        let token = parse_authorization(authorization.ok_or(AuthError::Missing)?)?;
        if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            Err(AuthError::InvalidSecret)
        }
    }
}
