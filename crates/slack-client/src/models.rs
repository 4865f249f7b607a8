//! Slack Web API payloads

use serde::{Deserialize, Serialize};

/// Body of a `chat.postMessage` call
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PostMessageRequest {
    /// Channel id or name
    pub channel: String,
    /// Plain-text fallback shown in notifications
    pub text: String,
    /// Layout blocks
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
}

impl PostMessageRequest {
    /// Builds a message rendered as a single markdown section.
    pub fn markdown(channel: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            channel: channel.into(),
            blocks: vec![Block::Section {
                text: TextObject::mrkdwn(text.clone()),
            }],
            text,
        }
    }
}

/// Layout block
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    /// Section block holding a single text object
    Section {
        /// Section text
        text: TextObject,
    },
}

/// Text composition object
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TextObject {
    /// `mrkdwn` or `plain_text`
    #[serde(rename = "type")]
    pub kind: TextKind,
    /// Text content
    pub text: String,
}

impl TextObject {
    /// Markdown text object
    pub fn mrkdwn(text: impl Into<String>) -> Self {
        Self {
            kind: TextKind::Mrkdwn,
            text: text.into(),
        }
    }
}

/// Text formatting mode
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TextKind {
    /// Slack markdown
    Mrkdwn,
    /// Unformatted text
    PlainText,
}

/// Envelope returned by `chat.postMessage`
#[derive(Debug, Clone, Deserialize)]
pub struct PostMessageResponse {
    /// Whether Slack accepted the call
    pub ok: bool,
    /// Channel the message was posted to
    #[serde(default)]
    pub channel: Option<String>,
    /// Message timestamp (Slack's message id)
    #[serde(default)]
    pub ts: Option<String>,
    /// Error code when `ok` is false
    #[serde(default)]
    pub error: Option<String>,
}
