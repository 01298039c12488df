use thiserror::Error;
use wadesk_core::{FieldError, ValidationError, describe_field_errors};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("session expired; sign in again")]
    SessionExpired,
    #[error("backend rejected the bearer token")]
    Unauthorized,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{path} returned {status}: {message}")]
    Backend {
        path: String,
        status: u16,
        message: String,
    },
    #[error("{}", describe_field_errors(.0))]
    Rejected(Vec<FieldError>),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("push channel: {0}")]
    Push(String),
}

impl ClientError {
    /// True when the failure means the bearer token is no longer usable.
    pub fn is_auth(&self) -> bool {
        matches!(self, ClientError::SessionExpired | ClientError::Unauthorized)
    }
}
