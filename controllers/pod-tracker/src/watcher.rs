//! Kubernetes resource watchers.
//!
//! This module watches Pods and PodTrackers and triggers reconciliation using
//! kube_runtime::Controller:
//! - Pods are reflected into a store, filtered on resource version and passed
//!   through the event mapper before they reach the controller.
//! - PodTracker changes reconcile the tracker set only; they never name a pod.
//!
//! Failed reconciliations are requeued with a per-object Fibonacci backoff.

use crate::backoff::{FibonacciBackoff, RetryTracker};
use crate::error::ControllerError;
use crate::event_mapper::EventMapper;
use crate::reconciler::{stop_requested, ReconcileRequest, Reconciler};
use crate::store::ObjectKey;
use crds::PodTracker;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Resource};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{predicates, reflector, watcher, Controller, WatchStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shared state handed to every reconciliation of one controller.
#[derive(Debug)]
pub struct Context {
    reconciler: Arc<Reconciler>,
    retry: RetryTracker,
    timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Context {
    /// Creates a context with its own retry bookkeeping.
    pub fn new(
        reconciler: Arc<Reconciler>,
        backoff: FibonacciBackoff,
        timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reconciler,
            retry: RetryTracker::new(backoff),
            timeout,
            shutdown,
        }
    }

    async fn reconcile(&self, request: ReconcileRequest, key: &ObjectKey) -> Result<Action, ControllerError> {
        let mut shutdown = self.shutdown.clone();
        let outcome = self
            .reconciler
            .reconcile_with_deadline(&request, self.timeout, &mut shutdown)
            .await?;
        debug!("Reconciled {} ({:?})", request, outcome);
        self.retry.reset(key);
        Ok(Action::await_change())
    }
}

/// Turns a raw Pod watch stream into the stream of pods to reconcile.
///
/// Events whose resource version was already seen are dropped, then every
/// remaining pod goes through the event mapper under `deadline`. Only
/// admitted pods come out, as they stand after marking.
pub fn tracked_pods<S>(
    pods: S,
    mapper: Arc<EventMapper>,
    deadline: Duration,
    shutdown: watch::Receiver<bool>,
) -> impl Stream<Item = Result<Pod, watcher::Error>> + Send + 'static
where
    S: Stream<Item = Result<Pod, watcher::Error>> + Send + 'static,
{
    pods.predicate_filter(predicates::resource_version)
        .filter_map(move |event| {
            let mapper = Arc::clone(&mapper);
            let mut shutdown = shutdown.clone();
            async move {
                match event {
                    Ok(pod) => mapper
                        .admit_with_deadline(&pod, deadline, &mut shutdown)
                        .await
                        .map(Ok),
                    Err(e) => Some(Err(e)),
                }
            }
        })
}

/// Reconciles one admitted pod.
pub async fn reconcile_pod(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let Some(key) = ObjectKey::of(pod.as_ref()) else {
        return Ok(Action::await_change());
    };
    ctx.reconcile(ReconcileRequest::Pod(key.clone()), &key).await
}

/// Reconciles the tracker set after a PodTracker changed.
pub async fn reconcile_trackers(
    tracker: Arc<PodTracker>,
    ctx: Arc<Context>,
) -> Result<Action, ControllerError> {
    let Some(key) = ObjectKey::of(tracker.as_ref()) else {
        return Ok(Action::await_change());
    };
    info!("PodTracker applied: {} ({})", key, tracker.spec.name);
    ctx.reconcile(ReconcileRequest::AllTrackers, &key).await
}

/// Error policy: retryable failures requeue with backoff, the rest wait for
/// the next change of the object.
pub fn error_policy<K: Resource>(obj: Arc<K>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    let Some(key) = ObjectKey::of(obj.as_ref()) else {
        return Action::await_change();
    };

    if error.is_retryable() {
        let delay = ctx.retry.next_delay(&key);
        warn!("Reconciliation of {} failed, retrying in {:?}: {}", key, delay, error);
        Action::requeue(delay)
    } else {
        error!("Reconciliation of {} failed permanently: {}", key, error);
        ctx.retry.reset(&key);
        Action::await_change()
    }
}

/// Tunables shared by both controllers.
#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    /// Concurrent reconciliations per controller
    pub concurrency: u16,
    /// Deadline for one admission or reconciliation
    pub timeout: Duration,
    /// Requeue backoff for failed reconciliations
    pub backoff: FibonacciBackoff,
}

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    pod_api: Api<Pod>,
    tracker_api: Api<PodTracker>,
    mapper: Arc<EventMapper>,
    reconciler: Arc<Reconciler>,
    settings: WatchSettings,
    shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        pod_api: Api<Pod>,
        tracker_api: Api<PodTracker>,
        mapper: Arc<EventMapper>,
        reconciler: Arc<Reconciler>,
        settings: WatchSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pod_api,
            tracker_api,
            mapper,
            reconciler,
            settings,
            shutdown,
        }
    }

    fn context(&self) -> Arc<Context> {
        Arc::new(Context::new(
            Arc::clone(&self.reconciler),
            self.settings.backoff,
            self.settings.timeout,
            self.shutdown.clone(),
        ))
    }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::default().concurrency(self.settings.concurrency)
    }

    /// Starts watching Pod resources.
    pub async fn watch_pods(&self) -> Result<(), ControllerError> {
        info!("Starting Pod watcher");

        let (reader, writer) = reflector::store::<Pod>();
        let pods = watcher(self.pod_api.clone(), watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .applied_objects();
        let trigger = tracked_pods(
            pods,
            Arc::clone(&self.mapper),
            self.settings.timeout,
            self.shutdown.clone(),
        );

        let mut stop = self.shutdown.clone();
        Controller::for_stream(trigger, reader)
            .with_config(self.controller_config())
            .graceful_shutdown_on(async move { stop_requested(&mut stop).await })
            .run(reconcile_pod, error_policy::<Pod>, self.context())
            .for_each(|res| async move {
                if let Err(e) = res {
                    warn!("Pod controller error: {}", e);
                }
            })
            .await;

        self.finished("Pod")
    }

    /// Starts watching PodTracker resources.
    pub async fn watch_trackers(&self) -> Result<(), ControllerError> {
        info!("Starting PodTracker watcher");

        let mut stop = self.shutdown.clone();
        Controller::new(self.tracker_api.clone(), watcher::Config::default())
            .with_config(self.controller_config())
            .graceful_shutdown_on(async move { stop_requested(&mut stop).await })
            .run(reconcile_trackers, error_policy::<PodTracker>, self.context())
            .for_each(|res| async move {
                if let Err(e) = res {
                    warn!("PodTracker controller error: {}", e);
                }
            })
            .await;

        self.finished("PodTracker")
    }

    fn finished(&self, kind: &str) -> Result<(), ControllerError> {
        if *self.shutdown.borrow() {
            info!("{} watcher stopped", kind);
            Ok(())
        } else {
            Err(ControllerError::Watch(format!("{} watch stream ended", kind)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_mapper::MarkerWrite;
    use crate::notifier::Notifier;
    use crate::reconciler::{DeliveryFailurePolicy, TrackerSelection};
    use crate::test_utils::*;
    use crds::{MARKER_ANNOTATION_KEY, MARKER_ANNOTATION_VALUE};
    use slack_client::MockSlackClient;

    struct Fixture {
        store: Arc<MockStore>,
        sink: Arc<MockSlackClient>,
        mapper: Arc<EventMapper>,
        ctx: Arc<Context>,
        shutdown: watch::Sender<bool>,
    }

    fn fixture(policy: DeliveryFailurePolicy) -> Fixture {
        let store = Arc::new(MockStore::new());
        let sink = Arc::new(MockSlackClient::new());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            Notifier::new(sink.clone()),
            TrackerSelection::All,
            policy,
        ));
        let mapper = Arc::new(EventMapper::new(store.clone(), "default", MarkerWrite::Merge, 3));
        let (shutdown, rx) = watch::channel(false);
        let ctx = Arc::new(Context::new(
            reconciler,
            FibonacciBackoff::new(1, 60),
            Duration::from_secs(5),
            rx,
        ));

        Fixture {
            store,
            sink,
            mapper,
            ctx,
            shutdown,
        }
    }

    impl Fixture {
        async fn tracked(&self, events: Vec<Pod>) -> Vec<Pod> {
            let events = futures::stream::iter(events.into_iter().map(Ok));
            tracked_pods(
                events,
                Arc::clone(&self.mapper),
                Duration::from_secs(5),
                self.shutdown.subscribe(),
            )
            .filter_map(|res| async move { res.ok() })
            .collect()
            .await
        }
    }

    #[tokio::test]
    async fn test_new_pod_is_reported_once() {
        let f = fixture(DeliveryFailurePolicy::Drop);
        f.store.add_tracker(create_test_tracker("alerts", "xoxb-1", "C0123"));
        let created = create_test_pod("default", "web-7f9", &[]);
        f.store.add_pod(created.clone());

        // Our marker write bumps the pod to version 2; the watch then delivers
        // that write and, after a reconnect, the same version again
        let mut echo = create_test_pod("default", "web-7f9", &[(MARKER_ANNOTATION_KEY, MARKER_ANNOTATION_VALUE)]);
        echo.metadata.resource_version = Some("2".to_string());
        let tracked = f.tracked(vec![created, echo.clone(), echo]).await;

        assert_eq!(tracked.len(), 1);
        for pod in tracked {
            let action = reconcile_pod(Arc::new(pod), Arc::clone(&f.ctx)).await.unwrap();
            assert_eq!(action, Action::await_change());
        }

        let sent = f.sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, "New pod created: web-7f9");
        assert_eq!(f.store.replace_calls(), 1);
    }

    #[tokio::test]
    async fn test_foreign_and_other_namespace_pods_are_not_tracked() {
        let f = fixture(DeliveryFailurePolicy::Drop);
        let foreign = create_test_pod("default", "db-0", &[("team", "payments")]);
        let system = create_test_pod("kube-system", "coredns", &[]);
        f.store.add_pod(foreign.clone());
        f.store.add_pod(system.clone());

        assert!(f.tracked(vec![foreign, system]).await.is_empty());
        assert_eq!(f.store.replace_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_admission_does_not_stall_the_stream() {
        let f = fixture(DeliveryFailurePolicy::Drop);
        let slow = create_test_pod("default", "web-7f9", &[]);
        f.store.add_pod(slow.clone());
        f.store.delay_get(Duration::from_secs(600));

        let tracked = f.tracked(vec![slow]).await;

        assert!(tracked.is_empty());
        assert_eq!(f.store.replace_calls(), 0);
    }

    #[tokio::test]
    async fn test_tracker_change_never_reads_pods() {
        let f = fixture(DeliveryFailurePolicy::Drop);
        let tracker = create_test_tracker("web-7f9", "xoxb-1", "C0123");
        f.store.add_tracker(tracker.clone());
        // A pod sharing the tracker's namespace and name
        f.store.add_pod(create_test_pod("default", "web-7f9", &[("team", "payments")]));

        let action = reconcile_trackers(Arc::new(tracker), Arc::clone(&f.ctx)).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(f.sink.attempts(), 0);
        assert_eq!(f.store.get_calls(), 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_requeues_with_growing_backoff() {
        let f = fixture(DeliveryFailurePolicy::Drop);
        f.store.add_tracker(create_test_tracker("alerts", "xoxb-1", "C0123"));
        let pod = Arc::new(create_test_pod("default", "web-7f9", &[]));
        f.store.add_pod((*pod).clone());
        f.store.fail_list("apiserver unavailable");

        let mut delays = Vec::new();
        for _ in 0..4 {
            let err = reconcile_pod(Arc::clone(&pod), Arc::clone(&f.ctx)).await.unwrap_err();
            delays.push(error_policy(Arc::clone(&pod), &err, Arc::clone(&f.ctx)));
        }
        let expected: Vec<Action> = [1, 1, 2, 3]
            .into_iter()
            .map(|s| Action::requeue(Duration::from_secs(s)))
            .collect();
        assert_eq!(delays, expected);
        assert!(f.sink.sent().is_empty());

        // Store recovers: the next attempt succeeds and the backoff resets
        f.store.clear_faults();
        let action = reconcile_pod(Arc::clone(&pod), Arc::clone(&f.ctx)).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(f.sink.sent().len(), 1);
        assert_eq!(f.ctx.retry.error_count(&ObjectKey::new("default", "web-7f9")), 0);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_requeued_only_under_retry_policy() {
        for (policy, requeued) in [
            (DeliveryFailurePolicy::Drop, false),
            (DeliveryFailurePolicy::Retry, true),
        ] {
            let f = fixture(policy);
            f.store.add_tracker(create_test_tracker("alerts", "xoxb-1", "C0123"));
            let pod = Arc::new(create_test_pod("default", "web-7f9", &[]));
            f.store.add_pod((*pod).clone());
            f.sink.fail_with("channel_not_found");

            let result = reconcile_pod(Arc::clone(&pod), Arc::clone(&f.ctx)).await;

            assert_eq!(result.is_err(), requeued, "{:?}", policy);
            assert_eq!(f.sink.attempts(), 1);
            if let Err(err) = result {
                let action = error_policy(Arc::clone(&pod), &err, Arc::clone(&f.ctx));
                assert_eq!(action, Action::requeue(Duration::from_secs(1)));
            }
        }
    }

    #[tokio::test]
    async fn test_permanent_error_waits_for_next_change() {
        let f = fixture(DeliveryFailurePolicy::Drop);
        let pod = Arc::new(create_test_pod("default", "web-7f9", &[]));
        let err = ControllerError::InvalidConfig("bad sink".to_string());

        let action = error_policy(pod, &err, Arc::clone(&f.ctx));

        assert_eq!(action, Action::await_change());
        assert_eq!(f.ctx.retry.error_count(&ObjectKey::new("default", "web-7f9")), 0);
    }

    #[tokio::test]
    async fn test_reconcile_after_shutdown_is_cancelled() {
        let f = fixture(DeliveryFailurePolicy::Drop);
        f.store.add_tracker(create_test_tracker("alerts", "xoxb-1", "C0123"));
        let pod = create_test_pod("default", "web-7f9", &[]);
        f.store.add_pod(pod.clone());
        f.shutdown.send(true).unwrap();

        let err = reconcile_pod(Arc::new(pod.clone()), Arc::clone(&f.ctx)).await.unwrap_err();
        assert!(matches!(err, ControllerError::Cancelled(_)));
        assert!(f.tracked(vec![pod]).await.is_empty());
        assert_eq!(f.sink.attempts(), 0);
    }
}
