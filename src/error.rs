//! Error taxonomy for the chat client.
//!
//! Every failure is recoverable: stores report it on the event bus as a
//! transient notification and leave their state as it was, and the caller
//! retries by repeating the user action.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Invalid credentials or an expired token.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The collaborator could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// Rejected locally before any network call.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The collaborator answered `success: false`.
    #[error("{0}")]
    Rejected(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("realtime channel error: {0}")]
    Realtime(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not logged in")]
    NoSession,
}

impl ChatError {
    /// Message suitable for a user-facing notification.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Auth(msg) | ChatError::Rejected(msg) | ChatError::Validation(msg) => {
                msg.clone()
            }
            other => other.to_string(),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ChatError::Auth(_))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                ChatError::Auth(err.to_string())
            }
            _ => ChatError::Network(err.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Realtime(err.to_string())
    }
}
