use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    /// The run's token was signalled. Not a failure.
    #[error("measurement cancelled")]
    Cancelled,

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status: {0}")]
    Status(StatusCode),

    #[error("response has no body")]
    EmptyBody,

    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl ProbeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProbeError::Cancelled)
    }
}
