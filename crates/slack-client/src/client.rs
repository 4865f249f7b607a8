//! Slack Web API client
//!
//! Implements `chat.postMessage`. The bot token is supplied per call because
//! each tracker carries its own credential.

use crate::error::SlackError;
use crate::models::{PostMessageRequest, PostMessageResponse};
use crate::sink_trait::MessageSink;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Public Slack Web API endpoint
pub const DEFAULT_BASE_URL: &str = "https://slack.com/api";

/// Slack Web API client
#[derive(Debug, Clone)]
pub struct SlackClient {
    client: Client,
    base_url: String,
}

impl SlackClient {
    /// Create a new Slack client
    ///
    /// # Arguments
    /// * `base_url` - Web API base URL (e.g., "https://slack.com/api")
    pub fn new(base_url: String) -> Result<Self, SlackError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Post a message to a channel
    ///
    /// # Returns
    /// * `Ok(PostMessageResponse)` - Slack accepted the message
    /// * `Err(SlackError)` - Transport failure, HTTP error or `ok: false`
    pub async fn post_message(
        &self,
        token: &str,
        request: &PostMessageRequest,
    ) -> Result<PostMessageResponse, SlackError> {
        let url = format!("{}/chat.postMessage", self.base_url);
        debug!("Posting message to channel {}", request.channel);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(SlackError::RateLimited { retry_after_secs });
        }

        let body = response.text().await?;
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SlackError::Authentication(format!("{} - {}", status, body)));
        }
        if !status.is_success() {
            return Err(SlackError::Api(format!(
                "chat.postMessage failed: {} - {}",
                status, body
            )));
        }

        let envelope: PostMessageResponse = serde_json::from_str(&body)?;
        check_envelope(envelope)
    }
}

/// Slack reports most failures as HTTP 200 with `ok: false`.
fn check_envelope(envelope: PostMessageResponse) -> Result<PostMessageResponse, SlackError> {
    if envelope.ok {
        return Ok(envelope);
    }

    let code = envelope.error.unwrap_or_else(|| "unknown_error".to_string());
    match code.as_str() {
        "not_authed" | "invalid_auth" | "account_inactive" | "token_revoked"
        | "token_expired" | "missing_scope" => Err(SlackError::Authentication(code)),
        "ratelimited" => Err(SlackError::RateLimited {
            retry_after_secs: None,
        }),
        _ => Err(SlackError::Api(code)),
    }
}

#[async_trait::async_trait]
impl MessageSink for SlackClient {
    async fn send(&self, channel: &str, key: &str, body: &str) -> Result<(), SlackError> {
        let request = PostMessageRequest::markdown(channel, body);
        let response = self.post_message(key, &request).await?;
        debug!(
            "Slack accepted message in {} (ts {})",
            response.channel.as_deref().unwrap_or(channel),
            response.ts.as_deref().unwrap_or("-")
        );
        Ok(())
    }
}
