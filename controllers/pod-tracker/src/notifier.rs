//! Notification delivery.
//!
//! Formats the "new pod" message for a tracker and hands it to the sink. A
//! failed delivery is logged and reported back; the notifier never retries.

use crate::store::ObjectKey;
use crds::PodTracker;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use slack_client::MessageSink;
use std::sync::Arc;
use tracing::{debug, warn};

/// One message owed to one tracker for one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    /// Tracker the message is addressed through
    pub tracker: ObjectKey,
    /// Pod the message is about
    pub workload: ObjectKey,
    /// Message body
    pub message: String,
}

impl NotificationEvent {
    /// Builds the notification for `pod` on behalf of `tracker`.
    pub fn new(tracker: &PodTracker, pod: &Pod) -> Self {
        Self {
            tracker: key_or_cluster(tracker),
            workload: key_or_cluster(pod),
            message: format!("New pod created: {}", pod.name_any()),
        }
    }
}

fn key_or_cluster<K: kube::Resource>(obj: &K) -> ObjectKey {
    ObjectKey::of(obj).unwrap_or_else(|| ObjectKey::new("", obj.name_any()))
}

/// Outcome of a single delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The sink accepted the message
    Success,
    /// The sink rejected the message or could not be reached
    Failure(String),
}

impl DeliveryResult {
    /// Whether the message was delivered.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Delivers tracker notifications through a [`MessageSink`].
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn MessageSink>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl Notifier {
    /// Creates a notifier over the given sink.
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self { sink }
    }

    /// Sends exactly one message for `pod` to the destination configured on
    /// `tracker`.
    pub async fn notify(&self, tracker: &PodTracker, pod: &Pod) -> DeliveryResult {
        let event = NotificationEvent::new(tracker, pod);
        let report = &tracker.spec.report;

        debug!(
            "Reporting Pod {} to tracker {} ({}) on channel {}",
            event.workload, event.tracker, tracker.spec.name, report.channel
        );

        match self.sink.send(&report.channel, &report.key, &event.message).await {
            Ok(()) => DeliveryResult::Success,
            Err(e) => {
                warn!(
                    "Failed to report Pod {} to channel {} for tracker {}: {}",
                    event.workload, report.channel, event.tracker, e
                );
                DeliveryResult::Failure(e.to_string())
            }
        }
    }
}
