//! Mock MessageSink for unit testing
//!
//! Records every message in memory and can be switched into a failing mode to
//! exercise delivery-failure paths without a Slack workspace.

use crate::error::SlackError;
use crate::sink_trait::MessageSink;
use std::sync::{Arc, Mutex};

/// A message captured by [`MockSlackClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Destination channel
    pub channel: String,
    /// Credential the caller supplied
    pub key: String,
    /// Message body
    pub body: String,
}

/// Mock Slack client for testing
#[derive(Debug, Clone, Default)]
pub struct MockSlackClient {
    sent: Arc<Mutex<Vec<SentMessage>>>,
    failure: Arc<Mutex<Option<String>>>,
    attempts: Arc<Mutex<usize>>,
}

impl MockSlackClient {
    /// Create a new mock client that accepts every message
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `send` fail with `SlackError::Api(code)`
    pub fn fail_with(&self, code: impl Into<String>) {
        *self.failure.lock().unwrap() = Some(code.into());
    }

    /// Accept messages again
    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Messages accepted so far
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Number of `send` calls, successful or not
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl MessageSink for MockSlackClient {
    async fn send(&self, channel: &str, key: &str, body: &str) -> Result<(), SlackError> {
        *self.attempts.lock().unwrap() += 1;

        if let Some(code) = self.failure.lock().unwrap().clone() {
            return Err(SlackError::Api(code));
        }

        self.sent.lock().unwrap().push(SentMessage {
            channel: channel.to_string(),
            key: key.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}
