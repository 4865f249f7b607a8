//! Controller-specific error types.
//!
//! This module defines error types specific to the Pod Tracker Controller
//! that are not covered by upstream library errors.

use crate::store::StoreError;
use kube::Error as KubeError;
use slack_client::SlackError;
use thiserror::Error;

/// Errors that can occur in the Pod Tracker Controller.
///
/// Errors returned from a reconciliation are retryable: the error
/// policy requeues the object with backoff. Startup errors end the process.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client error (startup)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// State store read/write failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Sink client could not be constructed
    #[error("Slack error: {0}")]
    Slack(#[from] SlackError),

    /// Notification delivery failed and the policy asks for a retry
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Reconciliation was cancelled by deadline or shutdown
    #[error("Reconciliation cancelled: {0}")]
    Cancelled(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether the scheduler should requeue the key after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Delivery(_) | Self::Cancelled(_)
        )
    }
}
