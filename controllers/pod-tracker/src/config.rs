//! Controller configuration.
//!
//! Process-level knobs are read from environment variables. Destinations
//! (sink credential and channel) are not configured here: they live on the
//! PodTracker objects.

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;
use crate::event_mapper::MarkerWrite;
use crate::reconciler::{DeliveryFailurePolicy, TrackerSelection};
use std::str::FromStr;
use std::time::Duration;

/// `WATCH_NAMESPACE` value selecting every namespace
const ALL_NAMESPACES: &str = "*";

/// Resolved controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace for the Pod watch (`None` = all namespaces). Defaults to
    /// the tracked pod namespace; `*` widens it to every namespace.
    pub watch_namespace: Option<String>,
    /// Namespace the event mapper admits pods from
    pub pod_namespace_filter: String,
    /// Which trackers each reconciliation notifies
    pub tracker_selection: TrackerSelection,
    /// How the marker annotation is written
    pub marker_write: MarkerWrite,
    /// Marker write attempts before giving up on conflicts
    pub marker_max_retries: u32,
    /// Whether delivery failures fail the reconciliation
    pub delivery_failure_policy: DeliveryFailurePolicy,
    /// Concurrent reconciliations per controller
    pub worker_concurrency: u16,
    /// Per-reconciliation deadline
    pub reconcile_timeout: Duration,
    /// Requeue backoff for failed reconciliations
    pub backoff: FibonacciBackoff,
    /// Slack Web API base URL
    pub slack_api_url: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: Some("default".to_string()),
            pod_namespace_filter: "default".to_string(),
            tracker_selection: TrackerSelection::default(),
            marker_write: MarkerWrite::default(),
            marker_max_retries: 3,
            delivery_failure_policy: DeliveryFailurePolicy::default(),
            worker_concurrency: 3,
            reconcile_timeout: Duration::from_secs(30),
            backoff: FibonacciBackoff::default(),
            slack_api_url: slack_client::DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Loads configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let backoff_min: u64 = parse_or(&get, "BACKOFF_MIN_SECS", 1)?;
        let backoff_max: u64 = parse_or(&get, "BACKOFF_MAX_SECS", 60)?;
        if backoff_max < backoff_min {
            return Err(ControllerError::InvalidConfig(format!(
                "BACKOFF_MAX_SECS ({}) must not be below BACKOFF_MIN_SECS ({})",
                backoff_max, backoff_min
            )));
        }

        let worker_concurrency: u16 = parse_or(&get, "WORKER_CONCURRENCY", defaults.worker_concurrency)?;
        if worker_concurrency == 0 {
            return Err(ControllerError::InvalidConfig(
                "WORKER_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        let marker_max_retries: u32 = parse_or(&get, "MARKER_MAX_RETRIES", defaults.marker_max_retries)?;
        if marker_max_retries == 0 {
            return Err(ControllerError::InvalidConfig(
                "MARKER_MAX_RETRIES must be at least 1".to_string(),
            ));
        }

        let timeout_secs: u64 = parse_or(&get, "RECONCILE_TIMEOUT_SECS", defaults.reconcile_timeout.as_secs())?;

        let pod_namespace_filter = get("POD_NAMESPACE_FILTER").unwrap_or(defaults.pod_namespace_filter);
        let watch_namespace = match get("WATCH_NAMESPACE") {
            Some(ns) if ns.trim() == ALL_NAMESPACES => None,
            Some(ns) => Some(ns),
            None => Some(pod_namespace_filter.clone()),
        };

        Ok(Self {
            watch_namespace,
            pod_namespace_filter,
            tracker_selection: parse_or(&get, "TRACKER_SELECTION", defaults.tracker_selection)?,
            marker_write: parse_or(&get, "MARKER_WRITE", defaults.marker_write)?,
            marker_max_retries,
            delivery_failure_policy: parse_or(&get, "DELIVERY_FAILURE_POLICY", defaults.delivery_failure_policy)?,
            worker_concurrency,
            reconcile_timeout: Duration::from_secs(timeout_secs.max(1)),
            backoff: FibonacciBackoff::new(backoff_min, backoff_max),
            slack_api_url: get("SLACK_API_URL").unwrap_or(defaults.slack_api_url),
        })
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{}={}: {}", name, raw, e))
        }),
        None => Ok(default),
    }
}
