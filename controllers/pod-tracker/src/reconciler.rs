//! Reconciliation logic.
//!
//! A reconciliation is stateless: it re-lists the trackers, re-reads the pod
//! named by the request and delivers one notification per selected tracker.
//! Whether a pod is ours was already decided (and recorded on the pod) by the
//! event mapper.

use crate::error::ControllerError;
use crate::notifier::{DeliveryResult, Notifier};
use crate::store::{ClusterStore, ObjectKey};
use crds::PodTracker;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A unit of reconciliation work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReconcileRequest {
    /// A pod admitted by the event mapper
    Pod(ObjectKey),
    /// The tracker set changed; re-read it without touching any pod
    AllTrackers,
}

impl From<ObjectKey> for ReconcileRequest {
    fn from(key: ObjectKey) -> Self {
        Self::Pod(key)
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pod(key) => write!(f, "Pod {}", key),
            Self::AllTrackers => write!(f, "all PodTrackers"),
        }
    }
}

/// Which trackers a reconciliation notifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerSelection {
    /// Every tracker receives the event independently
    #[default]
    All,
    /// Only the first tracker in listing order (single-tenant behaviour)
    First,
}

impl FromStr for TrackerSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "first" => Ok(Self::First),
            other => Err(format!("unknown tracker selection '{}' (expected all|first)", other)),
        }
    }
}

/// What a failed delivery does to the reconciliation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryFailurePolicy {
    /// Log and report `Done`: at most one delivery attempt per event
    #[default]
    Drop,
    /// Fail the reconciliation so it is retried; trackers that already
    /// received the message may receive it again
    Retry,
}

impl FromStr for DeliveryFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "retry" => Ok(Self::Retry),
            other => Err(format!("unknown delivery failure policy '{}' (expected drop|retry)", other)),
        }
    }
}

/// Terminal outcome of a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Notifications were attempted
    Done,
    /// Nothing to do (no trackers, or the pod is gone)
    DoneNoRequeue,
}

/// Reconciles pod requests against the configured trackers.
pub struct Reconciler {
    store: Arc<dyn ClusterStore>,
    notifier: Notifier,
    selection: TrackerSelection,
    delivery_policy: DeliveryFailurePolicy,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("selection", &self.selection)
            .field("delivery_policy", &self.delivery_policy)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        store: Arc<dyn ClusterStore>,
        notifier: Notifier,
        selection: TrackerSelection,
        delivery_policy: DeliveryFailurePolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            selection,
            delivery_policy,
        }
    }

    /// Reconciles one request.
    ///
    /// For a pod request this method:
    /// 1. Lists all PodTrackers (failure is retryable)
    /// 2. Stops if none are configured
    /// 3. Selects the trackers to notify
    /// 4. Loads the pod named by the request (gone means nothing to do)
    /// 5. Sends one notification per selected tracker
    ///
    /// Delivery failures only fail the reconciliation under
    /// [`DeliveryFailurePolicy::Retry`]. A tracker request never looks up a
    /// pod: it only re-reads the tracker set.
    pub async fn reconcile(
        &self,
        request: &ReconcileRequest,
    ) -> Result<ReconcileOutcome, ControllerError> {
        info!("Reconciling {}", request);

        let trackers = self.store.list_trackers().await.map_err(|e| {
            warn!("Can't list PodTrackers: {}", e);
            ControllerError::Store(e)
        })?;

        let key = match request {
            ReconcileRequest::Pod(key) => key,
            ReconcileRequest::AllTrackers => {
                self.check_trackers(&trackers);
                return Ok(ReconcileOutcome::DoneNoRequeue);
            }
        };

        if trackers.is_empty() {
            debug!("No PodTrackers configured");
            return Ok(ReconcileOutcome::DoneNoRequeue);
        }

        let selected = self.select(&trackers);

        let pod = match self.store.get_pod(key).await {
            Ok(Some(pod)) => pod,
            Ok(None) => {
                debug!("Pod {} not found, nothing to report", key);
                return Ok(ReconcileOutcome::DoneNoRequeue);
            }
            Err(e) if e.is_not_found() => {
                debug!("Pod {} not found, nothing to report", key);
                return Ok(ReconcileOutcome::DoneNoRequeue);
            }
            Err(e) => return Err(ControllerError::Store(e)),
        };

        debug!(
            "Found {} reporter(s) configured, sending report for Pod {}",
            selected.len(),
            key
        );

        let mut delivered = 0;
        let mut failures = Vec::new();
        for tracker in selected {
            let result = self.notifier.notify(tracker, &pod).await;
            if result.is_success() {
                delivered += 1;
            } else if let DeliveryResult::Failure(cause) = result {
                let name = tracker.metadata.name.as_deref().unwrap_or("<unknown>");
                failures.push(format!("{}: {}", name, cause));
            }
        }
        info!(
            "Reported Pod {} to {}/{} tracker(s)",
            key,
            delivered,
            selected.len()
        );

        if !failures.is_empty() && self.delivery_policy == DeliveryFailurePolicy::Retry {
            return Err(ControllerError::Delivery(failures.join("; ")));
        }

        Ok(ReconcileOutcome::Done)
    }

    /// Logs the tracker set a changed PodTracker leaves behind.
    fn check_trackers(&self, trackers: &[PodTracker]) {
        if trackers.is_empty() {
            info!("No PodTrackers configured, new pods will not be reported");
            return;
        }

        for tracker in trackers {
            let report = &tracker.spec.report;
            if report.key.trim().is_empty() || report.channel.trim().is_empty() {
                warn!(
                    "PodTracker {} has an empty report key or channel, deliveries will fail",
                    tracker.metadata.name.as_deref().unwrap_or("<unknown>")
                );
            }
        }
        info!(
            "{} PodTracker(s) configured, {} notified per pod",
            trackers.len(),
            self.select(trackers).len()
        );
    }

    /// Runs [`Self::reconcile`] under a deadline and the shutdown signal.
    ///
    /// Hitting either maps to [`ControllerError::Cancelled`], which the error
    /// policy requeues with backoff.
    pub async fn reconcile_with_deadline(
        &self,
        request: &ReconcileRequest,
        deadline: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ReconcileOutcome, ControllerError> {
        if *shutdown.borrow() {
            return Err(ControllerError::Cancelled("controller shutting down".to_string()));
        }

        tokio::select! {
            result = tokio::time::timeout(deadline, self.reconcile(request)) => {
                result.unwrap_or_else(|_| Err(ControllerError::Cancelled(format!(
                    "{} exceeded deadline of {:?}",
                    request, deadline
                ))))
            }
            _ = stop_requested(shutdown) => {
                Err(ControllerError::Cancelled("controller shutting down".to_string()))
            }
        }
    }

    fn select<'a>(&self, trackers: &'a [PodTracker]) -> &'a [PodTracker] {
        match self.selection {
            TrackerSelection::All => trackers,
            TrackerSelection::First => &trackers[..trackers.len().min(1)],
        }
    }
}

/// Resolves once shutdown is signalled. A dropped sender never resolves.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stopping| *stopping).await.is_err() {
        std::future::pending::<()>().await;
    }
}
