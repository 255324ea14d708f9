use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_ERROR_MESSAGE: &str = "An unexpected error occurred";

/// The only error shape the backend returns: a human-readable message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    /// Parses a raw response body, falling back to the generic message when the
    /// body is empty, not JSON, or has no `message` field.
    pub fn message_or_default(raw: &str) -> String {
        serde_json::from_str::<ErrorBody>(raw)
            .ok()
            .and_then(|body| body.message)
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string())
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed realtime frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown realtime event: {0}")]
    UnknownEvent(String),
}
