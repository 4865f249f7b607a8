//! Slack client errors

use thiserror::Error;

/// Errors that can occur when posting to the Slack Web API
#[derive(Debug, Error)]
pub enum SlackError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Slack answered with `ok: false`
    #[error("Slack API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Token missing, revoked or lacking scopes
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Slack asked us to slow down
    #[error("Rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited {
        /// Value of the `Retry-After` header, if present
        retry_after_secs: Option<u64>,
    },
}
