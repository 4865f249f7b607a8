//! MessageSink trait for mocking
//!
//! This trait abstracts message delivery so the controller can be tested
//! without reaching Slack. The concrete `SlackClient` implements it, and tests
//! can use `MockSlackClient` (feature `test-util`).

use crate::error::SlackError;

/// Delivery of a single text message to an external channel.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait MessageSink: Send + Sync {
    /// Sends `body` to `channel`, authenticating with `key`.
    ///
    /// The key and channel are used verbatim; the remote end validates them.
    async fn send(&self, channel: &str, key: &str, body: &str) -> Result<(), SlackError>;
}
