//! Pod Tracker Controller
//!
//! Announces newly seen pods to the destinations configured on `PodTracker`
//! custom resources.
//!
//! Pods in the tracked namespace are claimed by stamping the
//! `SourceCRD=crd.kube.op` annotation on them; every claimed pod is then
//! reported once per tracker through the Slack Web API.

mod backoff;
mod config;
mod controller;
mod error;
mod event_mapper;
mod notifier;
mod reconciler;
mod store;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Pod Tracker Controller");

    // Load configuration from environment variables
    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Watch namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Tracked pod namespace: {}", config.pod_namespace_filter);
    info!("  Tracker selection: {:?}", config.tracker_selection);
    info!("  Marker write: {:?} (max {} attempts)", config.marker_write, config.marker_max_retries);
    info!("  Delivery failure policy: {:?}", config.delivery_failure_policy);
    info!("  Concurrent reconciles per controller: {}", config.worker_concurrency);
    info!("  Reconcile timeout: {:?}", config.reconcile_timeout);
    info!("  Slack API: {}", config.slack_api_url);

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
