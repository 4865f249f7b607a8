//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the store, sink,
//! event mapper and reconciler together, starts the Pod and PodTracker
//! watchers, and shuts them down when one of them exits or the process is
//! interrupted.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::event_mapper::EventMapper;
use crate::notifier::Notifier;
use crate::reconciler::Reconciler;
use crate::store::{ClusterStore, KubeStore};
use crate::watcher::{WatchSettings, Watcher};
use crds::PodTracker;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use slack_client::SlackClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long in-flight reconciliations get to finish after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type WatchHandle = JoinHandle<Result<(), ControllerError>>;

/// Main controller for pod tracking.
#[derive(Debug)]
pub struct Controller {
    pod_watcher: WatchHandle,
    tracker_watcher: WatchHandle,
    shutdown: watch::Sender<bool>,
}

impl Controller {
    /// Creates a new controller instance and starts its watchers.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Pod Tracker Controller");

        // Create Kubernetes client
        let kube_client = Client::try_default().await?;

        // Create sink client; credentials come from each PodTracker
        let slack = SlackClient::new(config.slack_api_url.clone())?;

        let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(kube_client.clone()));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Notifier::new(Arc::new(slack)),
            config.tracker_selection,
            config.delivery_failure_policy,
        ));
        let mapper = Arc::new(EventMapper::new(
            store,
            config.pod_namespace_filter.clone(),
            config.marker_write,
            config.marker_max_retries,
        ));

        // Create API clients
        let pod_api: Api<Pod> = match config.watch_namespace.as_deref() {
            Some(ns) => Api::namespaced(kube_client.clone(), ns),
            None => Api::all(kube_client.clone()),
        };
        let tracker_api: Api<PodTracker> = Api::all(kube_client);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let settings = WatchSettings {
            concurrency: config.worker_concurrency,
            timeout: config.reconcile_timeout,
            backoff: config.backoff,
        };
        let watcher_instance = Arc::new(Watcher::new(
            pod_api,
            tracker_api,
            mapper,
            reconciler,
            settings,
            shutdown_rx,
        ));

        // Start watchers in background tasks
        let pod_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_pods().await })
        };
        let tracker_watcher = {
            let watcher = watcher_instance;
            tokio::spawn(async move { watcher.watch_trackers().await })
        };

        Ok(Self {
            pod_watcher,
            tracker_watcher,
            shutdown,
        })
    }

    /// Runs the controller until a watcher exits or Ctrl-C is received.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Pod Tracker Controller running");

        // Watchers run forever; either one exiting ends the controller
        let result = tokio::select! {
            result = &mut self.pod_watcher => flatten("Pod", result),
            result = &mut self.tracker_watcher => flatten("PodTracker", result),
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Received Ctrl-C, shutting down"),
                    Err(e) => warn!("Failed to listen for Ctrl-C ({}), shutting down", e),
                }
                Ok(())
            }
        };

        self.stop().await;
        result
    }

    async fn stop(self) {
        // Graceful shutdown: controllers stop taking new work and drain
        if self.shutdown.send(true).is_err() {
            warn!("Both watchers already exited");
        }

        for (kind, handle) in [("Pod", self.pod_watcher), ("PodTracker", self.tracker_watcher)] {
            if handle.is_finished() {
                continue;
            }
            let abort = handle.abort_handle();
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(result) => {
                    if let Err(e) = flatten(kind, result) {
                        warn!("{}", e);
                    }
                }
                Err(_) => {
                    warn!("{} watcher did not stop within {:?}, aborting", kind, SHUTDOWN_GRACE);
                    abort.abort();
                }
            }
        }
        info!("Pod Tracker Controller stopped");
    }
}

fn flatten(
    kind: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    result
        .map_err(|e| ControllerError::Watch(format!("{} watcher panicked: {}", kind, e)))?
        .map_err(|e| ControllerError::Watch(format!("{} watcher error: {}", kind, e)))
}
