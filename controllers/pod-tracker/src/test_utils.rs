//! Test utilities for unit testing the reconciliation core
//!
//! This module provides an in-memory `ClusterStore` with fault injection and
//! helpers for building test objects.

use crate::store::{ClusterStore, ObjectKey, StoreError};
use crds::{PodTracker, PodTrackerSpec, Reporter};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// Helper to create a test Pod
pub fn create_test_pod(namespace: &str, name: &str, annotations: &[(&str, &str)]) -> Pod {
    let annotations = (!annotations.is_empty()).then(|| {
        annotations
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<BTreeMap<_, _>>()
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some("1".to_string()),
            annotations,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Helper to create a test PodTracker
pub fn create_test_tracker(name: &str, key: &str, channel: &str) -> PodTracker {
    let mut tracker = PodTracker::new(
        name,
        PodTrackerSpec {
            name: format!("{} tracker", name),
            report: Reporter {
                key: key.to_string(),
                channel: channel.to_string(),
            },
        },
    );
    tracker.metadata.namespace = Some("default".to_string());
    tracker
}

/// In-memory `ClusterStore`
///
/// Pods are versioned: every accepted write bumps `resourceVersion`, and a
/// write carrying a stale version is rejected with `Conflict`, mirroring the
/// API server.
#[derive(Debug, Default)]
pub struct MockStore {
    trackers: Mutex<Vec<PodTracker>>,
    pods: Mutex<BTreeMap<ObjectKey, Pod>>,
    list_error: Mutex<Option<String>>,
    get_error: Mutex<Option<String>>,
    replace_error: Mutex<Option<String>>,
    injected_conflicts: Mutex<u32>,
    rival_annotation: Mutex<Option<(String, String)>>,
    list_delay: Mutex<Option<Duration>>,
    get_delay: Mutex<Option<Duration>>,
    get_calls: Mutex<usize>,
    replace_calls: Mutex<usize>,
    accepted_writes: Mutex<usize>,
}

impl MockStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tracker (listing order is insertion order)
    pub fn add_tracker(&self, tracker: PodTracker) {
        self.trackers.lock().unwrap().push(tracker);
    }

    /// Add or overwrite a pod
    pub fn add_pod(&self, pod: Pod) {
        let key = ObjectKey::of(&pod).unwrap();
        self.pods.lock().unwrap().insert(key, pod);
    }

    /// Remove a pod
    pub fn remove_pod(&self, key: &ObjectKey) {
        self.pods.lock().unwrap().remove(key);
    }

    /// Current copy of a pod
    pub fn pod(&self, key: &ObjectKey) -> Option<Pod> {
        self.pods.lock().unwrap().get(key).cloned()
    }

    /// Annotations currently stored on a pod
    pub fn annotations(&self, key: &ObjectKey) -> BTreeMap<String, String> {
        self.pod(key)
            .map(|p| p.annotations().clone())
            .unwrap_or_default()
    }

    /// Make `list_trackers` fail
    pub fn fail_list(&self, msg: &str) {
        *self.list_error.lock().unwrap() = Some(msg.to_string());
    }

    /// Make `get_pod` fail
    pub fn fail_get(&self, msg: &str) {
        *self.get_error.lock().unwrap() = Some(msg.to_string());
    }

    /// Make `replace_pod` fail with a non-conflict error
    pub fn fail_replace(&self, msg: &str) {
        *self.replace_error.lock().unwrap() = Some(msg.to_string());
    }

    /// Drop every injected failure and delay
    pub fn clear_faults(&self) {
        *self.list_error.lock().unwrap() = None;
        *self.get_error.lock().unwrap() = None;
        *self.replace_error.lock().unwrap() = None;
        *self.list_delay.lock().unwrap() = None;
        *self.get_delay.lock().unwrap() = None;
    }

    /// Delay `list_trackers` (for deadline tests)
    pub fn delay_list(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    /// Delay `get_pod` (for admission deadline tests)
    pub fn delay_get(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = Some(delay);
    }

    /// Simulate `count` concurrent writers winning the race against the next
    /// `count` writes. Each rival write bumps the stored version and, when
    /// set via [`Self::rival_writes_annotation`], adds its own annotation.
    pub fn inject_conflicts(&self, count: u32) {
        *self.injected_conflicts.lock().unwrap() = count;
    }

    /// Annotation added by each simulated rival writer
    pub fn rival_writes_annotation(&self, key: &str, value: &str) {
        *self.rival_annotation.lock().unwrap() = Some((key.to_string(), value.to_string()));
    }

    /// Number of `get_pod` calls
    pub fn get_calls(&self) -> usize {
        *self.get_calls.lock().unwrap()
    }

    /// Number of `replace_pod` calls
    pub fn replace_calls(&self) -> usize {
        *self.replace_calls.lock().unwrap()
    }

    /// Number of writes that landed (ours and rivals')
    pub fn accepted_writes(&self) -> usize {
        *self.accepted_writes.lock().unwrap()
    }

    fn bump_version(pod: &mut Pod) {
        let next = pod
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        pod.metadata.resource_version = Some(next.to_string());
    }
}

#[async_trait::async_trait]
impl ClusterStore for MockStore {
    async fn list_trackers(&self) -> Result<Vec<PodTracker>, StoreError> {
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(msg) = self.list_error.lock().unwrap().clone() {
            return Err(StoreError::Unavailable(msg));
        }
        Ok(self.trackers.lock().unwrap().clone())
    }

    async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>, StoreError> {
        *self.get_calls.lock().unwrap() += 1;
        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(msg) = self.get_error.lock().unwrap().clone() {
            return Err(StoreError::Unavailable(msg));
        }
        Ok(self.pod(key))
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        *self.replace_calls.lock().unwrap() += 1;

        if let Some(msg) = self.replace_error.lock().unwrap().clone() {
            return Err(StoreError::Unavailable(msg));
        }

        let key = ObjectKey::of(pod).unwrap();
        let mut pods = self.pods.lock().unwrap();
        let stored = pods
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let mut conflicts = self.injected_conflicts.lock().unwrap();
        if *conflicts > 0 {
            *conflicts -= 1;
            if let Some((k, v)) = self.rival_annotation.lock().unwrap().clone() {
                stored.annotations_mut().insert(k, v);
            }
            Self::bump_version(stored);
            *self.accepted_writes.lock().unwrap() += 1;
        }

        if stored.metadata.resource_version != pod.metadata.resource_version {
            return Err(StoreError::Conflict(format!(
                "the object has been modified; please apply your changes to the latest version ({})",
                key
            )));
        }

        let mut written = pod.clone();
        Self::bump_version(&mut written);
        *stored = written.clone();
        *self.accepted_writes.lock().unwrap() += 1;
        Ok(written)
    }
}
