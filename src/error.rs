//! Typed errors for connection descriptors.
//!
//! Construction can only fail with [`ConnectionError::MissingRequiredField`]
//! (or a JSON error when the input is not a valid document). The remaining
//! variants are raised by consumer-side helpers in
//! [`crate::connection::policy`] and [`crate::resolve`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// A required field was absent at construction time.
    #[error("missing required field `{field}`")]
    MissingRequiredField { field: &'static str },

    /// The input document could not be parsed.
    #[error("invalid connection document: {0}")]
    Json(#[from] serde_json::Error),

    /// A field still holds a deferred value where a concrete one is needed.
    #[error("field `{field}` is deferred ({id}) and has not been resolved")]
    Unresolved { field: &'static str, id: String },

    #[error("port {0} is not a valid TCP port")]
    InvalidPort(f64),

    #[error("private key could not be decoded: {0}")]
    InvalidPrivateKey(String),

    #[error("host key could not be parsed: {0}")]
    InvalidHostKey(String),

    /// Neither a private key, a password nor an agent socket is available.
    #[error("no credentials available for {user}@{host}")]
    NoCredentials { user: String, host: String },
}

impl ConnectionError {
    pub fn is_missing_field(&self) -> bool {
        matches!(self, ConnectionError::MissingRequiredField { .. })
    }
}
