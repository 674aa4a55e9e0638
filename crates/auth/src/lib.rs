//! `jobservice-auth`: shared-secret authentication boundary.
//!
//! Decoupled from HTTP: callers hand over the raw `Authorization` header value.

pub mod secret;

pub use secret::{AuthError, Authenticator, SECRET_ENV, SECRET_SCHEME, SecretAuthenticator, parse_authorization};
