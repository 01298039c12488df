use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::status::{StatusPayload, null_as_default};

/// Push event carrying a status snapshot.
pub const STATUS_EVENT: &str = "qr-status-update";
/// `status` marker returned while the backend is still generating a QR.
pub const QR_PROCESSING: &str = "processing";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed push frame: {0}")]
    Malformed(String),
    #[error("invalid {event} payload: {reason}")]
    InvalidPayload { event: String, reason: String },
}

/// Envelope of every text frame on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Decodes a push text frame. Events other than status updates yield `None`.
pub fn decode_frame(text: &str) -> Result<Option<StatusPayload>, FrameError> {
    let frame: PushFrame =
        serde_json::from_str(text).map_err(|err| FrameError::Malformed(err.to_string()))?;
    if frame.event != STATUS_EVENT {
        return Ok(None);
    }
    serde_json::from_value(frame.data)
        .map(Some)
        .map_err(|err| FrameError::InvalidPayload {
            event: frame.event.clone(),
            reason: err.to_string(),
        })
}

pub fn encode_frame(payload: &StatusPayload) -> Result<String, FrameError> {
    let data =
        serde_json::to_value(payload).map_err(|err| FrameError::Malformed(err.to_string()))?;
    serde_json::to_string(&PushFrame {
        event: STATUS_EVENT.to_owned(),
        data,
    })
    .map_err(|err| FrameError::Malformed(err.to_string()))
}

/// Body of `POST /qr-request`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrRequestResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub success: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub current_status: Option<StatusPayload>,
    #[serde(default)]
    pub message: Option<String>,
}

impl QrRequestResponse {
    pub fn is_processing(&self) -> bool {
        self.status.as_deref() == Some(QR_PROCESSING)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatusResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub success: bool,
    #[serde(default)]
    pub auth_status: Option<AuthStatus>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Whether the backend holds stored session credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuthStatus {
    #[serde(default, deserialize_with = "null_as_default")]
    pub exists: bool,
    #[serde(default)]
    pub details: Option<AuthDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuthDetails {
    #[serde(default)]
    pub size: Option<u64>,
}

/// Generic `{ success, message }` acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Ack {
    #[serde(default, deserialize_with = "null_as_default")]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors: Vec<FieldError>,
}

/// Joins field errors into one operator-facing line.
pub fn describe_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|err| format!("{}: {}", err.field, err.message))
        .collect::<Vec<_>>()
        .join(", ")
}
