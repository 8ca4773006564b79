use std::time::Duration;
use thiserror::Error;

/// Marker the middleware puts in front of "entity does not exist" failures.
pub const NOT_FOUND_CODE: &str = "[ENOENT]";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} failed: {message}")]
    Remote { method: String, message: String },

    #[error("HTTP {status}: {body}")]
    UploadRejected { status: u16, body: String },

    #[error("job {id} failed: {message}")]
    JobFailed { id: u64, message: String },

    #[error("job {id} still running after {timeout:?}")]
    JobTimeout { id: u64, timeout: Duration },

    #[error("job {0} not found")]
    JobNotFound(u64),

    #[error("wait for job {0} cancelled")]
    Cancelled(u64),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// True when the middleware reported that the referenced entity is gone.
    pub fn is_not_found(&self) -> bool {
        is_not_found(self)
    }

    /// True when we stopped waiting on a job that may still be running.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::JobTimeout { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::WebSocket(_) | ClientError::Http(_)
        )
    }
}

/// Classifies an error as "entity not found".
///
/// Only the `[ENOENT]` code qualifies. Validation failures such as
/// `[EINVAL] Parent pool does not exist` read similarly but mean the request
/// itself was wrong, so the text after the code is never inspected.
pub fn is_not_found<E>(err: &E) -> bool
where
    E: std::fmt::Display + ?Sized,
{
    err.to_string().contains(NOT_FOUND_CODE)
}

pub type Result<T> = std::result::Result<T, ClientError>;
