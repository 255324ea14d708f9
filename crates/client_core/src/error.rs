use reqwest::StatusCode;
use shared::error::ErrorBody;
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The backend rejected the credential even after one refresh-and-retry.
    #[error("unauthorized: credential rejected after refresh")]
    Unauthorized,
    /// Refresh failed; the session has been cleared.
    #[error("session expired: please sign in again")]
    SessionExpired,
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("realtime channel error: {0}")]
    Realtime(String),
    #[error("realtime channel is not connected")]
    NotConnected,
    #[error("not signed in: user profile not loaded")]
    NotSignedIn,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Validation(String),
}

/// Coarse failure classes, used to decide what the user sees and whether a
/// re-login is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Auth,
    Validation,
    Transport,
    Realtime,
}

impl ClientError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unauthorized | Self::SessionExpired | Self::NotSignedIn => ErrorCategory::Auth,
            Self::Rejected { .. } | Self::Config(_) | Self::Validation(_) => {
                ErrorCategory::Validation
            }
            Self::Transport(_) | Self::Decode(_) => ErrorCategory::Transport,
            Self::Realtime(_) | Self::NotConnected => ErrorCategory::Realtime,
        }
    }

    pub fn requires_reauth(&self) -> bool {
        self.category() == ErrorCategory::Auth
    }

    /// Builds a `Rejected` error from a non-success response, using the
    /// backend's `{message}` body when present.
    pub(crate) async fn from_rejected_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        Self::Rejected {
            status,
            message: ErrorBody::message_or_default(&raw),
        }
    }

    /// Message suitable for a transient user-facing notice.
    pub fn user_message(&self) -> String {
        match self {
            Self::Rejected { message, .. } => message.clone(),
            Self::Transport(_) | Self::Decode(_) => {
                shared::error::DEFAULT_ERROR_MESSAGE.to_string()
            }
            other => other.to_string(),
        }
    }
}
