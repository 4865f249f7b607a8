//! Pod event mapping.
//!
//! Turns a pod change notification into zero or one reconcile requests. The
//! mapper re-reads the pod instead of trusting the event payload, decides
//! whether the pod belongs to this controller, and stamps the marker
//! annotation before the pod is handed to the reconciler.
//!
//! The marker write is best effort: its failure is logged and never blocks the
//! request. The watch event our own write produces is recognised by its
//! resource version and skipped, so a new pod is reported once.

use crate::reconciler::{stop_requested, ReconcileRequest};
use crate::store::{ClusterStore, ObjectKey, StoreError};
use crds::{MARKER_ANNOTATION_KEY, MARKER_ANNOTATION_VALUE};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How the marker annotation is written onto a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkerWrite {
    /// Keep existing annotations and set only the marker key
    #[default]
    Merge,
    /// Replace the whole annotation map with the marker
    Replace,
}

impl FromStr for MarkerWrite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "replace" => Ok(Self::Replace),
            other => Err(format!("unknown marker write mode '{}' (expected merge|replace)", other)),
        }
    }
}

/// Ownership of a pod as seen through its annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationState {
    /// No annotations yet: first sighting, start tracking
    Untracked,
    /// Carries the marker with the expected value: report it
    Managed,
    /// Annotated by someone else: not ours
    Foreign,
}

impl AnnotationState {
    /// Classifies an annotation map.
    pub fn classify(annotations: Option<&BTreeMap<String, String>>) -> Self {
        match annotations {
            None => Self::Untracked,
            Some(map) if map.is_empty() => Self::Untracked,
            Some(map) if map.get(MARKER_ANNOTATION_KEY).map(String::as_str) == Some(MARKER_ANNOTATION_VALUE) => {
                Self::Managed
            }
            Some(_) => Self::Foreign,
        }
    }
}

/// Annotation map a pod should carry after marking.
pub fn marked_annotations(
    current: Option<&BTreeMap<String, String>>,
    mode: MarkerWrite,
) -> BTreeMap<String, String> {
    let mut desired = match mode {
        MarkerWrite::Merge => current.cloned().unwrap_or_default(),
        MarkerWrite::Replace => BTreeMap::new(),
    };
    desired.insert(
        MARKER_ANNOTATION_KEY.to_string(),
        MARKER_ANNOTATION_VALUE.to_string(),
    );
    desired
}

/// Maps pod events onto reconcile requests.
pub struct EventMapper {
    store: Arc<dyn ClusterStore>,
    namespace: String,
    write_mode: MarkerWrite,
    max_attempts: u32,
    /// Resource version left by our last marker write, per pod
    own_writes: Mutex<HashMap<ObjectKey, String>>,
}

impl std::fmt::Debug for EventMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMapper")
            .field("namespace", &self.namespace)
            .field("write_mode", &self.write_mode)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl EventMapper {
    /// Creates a new mapper.
    ///
    /// # Arguments
    /// * `namespace` - only pods in this namespace are admitted
    /// * `max_attempts` - marker write attempts before giving up on conflicts
    pub fn new(
        store: Arc<dyn ClusterStore>,
        namespace: impl Into<String>,
        write_mode: MarkerWrite,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            write_mode,
            max_attempts: max_attempts.max(1),
            own_writes: Mutex::new(HashMap::new()),
        }
    }

    /// Maps a pod change onto at most one reconcile request.
    ///
    /// Never fails: store errors are logged and yield no request (read) or do
    /// not prevent the request (marker write).
    pub async fn map_event(&self, pod: &Pod) -> Vec<ReconcileRequest> {
        self.admit(pod)
            .await
            .and_then(|tracked| ObjectKey::of(&tracked))
            .map(ReconcileRequest::from)
            .into_iter()
            .collect()
    }

    /// Admits a pod change and returns the pod as it stands after marking.
    ///
    /// `None` means the pod is not ours (wrong namespace, foreign
    /// annotations) or could not be read.
    pub async fn admit(&self, pod: &Pod) -> Option<Pod> {
        let key = ObjectKey::of(pod)?;

        if key.namespace != self.namespace {
            return None;
        }

        if self.is_own_write(&key, pod.metadata.resource_version.as_deref()) {
            debug!("Pod {} changed by our own marker write, skipping", key);
            return None;
        }

        let fresh = match self.store.get_pod(&key).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                debug!("Pod {} no longer exists, skipping", key);
                return None;
            }
            Err(e) => {
                warn!("Failed to read Pod {}: {}", key, e);
                return None;
            }
        };

        match AnnotationState::classify(fresh.metadata.annotations.as_ref()) {
            AnnotationState::Untracked => {
                info!("No annotations set, Pod {} is becoming a tracked one now", key);
            }
            AnnotationState::Managed => {
                debug!("Found a managed Pod {}, reporting it", key);
            }
            AnnotationState::Foreign => {
                debug!("Pod {} is annotated by someone else, ignoring", key);
                return None;
            }
        }

        self.mark(&key, fresh).await
    }

    /// Runs [`Self::admit`] under a deadline and the shutdown signal.
    ///
    /// Hitting either drops the event; the next change of the pod admits it
    /// again.
    pub async fn admit_with_deadline(
        &self,
        pod: &Pod,
        deadline: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Pod> {
        if *shutdown.borrow() {
            return None;
        }

        tokio::select! {
            result = tokio::time::timeout(deadline, self.admit(pod)) => {
                result.unwrap_or_else(|_| {
                    warn!(
                        "Admitting Pod {} exceeded deadline of {:?}, dropping event",
                        pod.name_any(),
                        deadline
                    );
                    None
                })
            }
            _ = stop_requested(shutdown) => {
                debug!("Shutting down, dropping event for Pod {}", pod.name_any());
                None
            }
        }
    }

    /// Writes the marker annotation, retrying read-modify-write on conflict.
    ///
    /// Returns the pod as last seen: the stored copy after a successful
    /// write, or the unmarked copy when the write could not land. `None`
    /// means the pod vanished or was claimed by someone else meanwhile.
    async fn mark(&self, key: &ObjectKey, mut pod: Pod) -> Option<Pod> {
        for attempt in 1..=self.max_attempts {
            let desired = marked_annotations(pod.metadata.annotations.as_ref(), self.write_mode);
            if pod.metadata.annotations.as_ref() == Some(&desired) {
                debug!("Pod {} already carries the marker", key);
                return Some(pod);
            }

            let mut marked = pod.clone();
            marked.metadata.annotations = Some(desired);

            match self.store.replace_pod(&marked).await {
                Ok(written) => {
                    debug!("Marked Pod {} (attempt {})", key, attempt);
                    self.record_own_write(key, &written);
                    return Some(written);
                }
                Err(StoreError::Conflict(msg)) => {
                    debug!(
                        "Conflict marking Pod {} (attempt {}/{}): {}",
                        key, attempt, self.max_attempts, msg
                    );
                }
                Err(e) => {
                    warn!("Error trying to update Pod {}: {}", key, e);
                    return Some(pod);
                }
            }

            if attempt == self.max_attempts {
                break;
            }

            pod = match self.store.get_pod(key).await {
                Ok(Some(p)) => p,
                Ok(None) => {
                    debug!("Pod {} deleted while marking", key);
                    return None;
                }
                Err(e) => {
                    warn!("Failed to re-read Pod {} after conflict: {}", key, e);
                    return Some(pod);
                }
            };

            if AnnotationState::classify(pod.metadata.annotations.as_ref()) == AnnotationState::Foreign {
                debug!("Pod {} was claimed by someone else while marking, ignoring", key);
                return None;
            }
        }

        warn!(
            "Giving up marking Pod {} after {} conflicting attempts",
            key, self.max_attempts
        );
        Some(pod)
    }

    fn record_own_write(&self, key: &ObjectKey, written: &Pod) {
        let Some(version) = written.metadata.resource_version.clone() else {
            return;
        };
        match self.own_writes.lock() {
            Ok(mut writes) => {
                writes.insert(key.clone(), version);
            }
            Err(e) => warn!("Failed to record marker write on Pod {}: {}", key, e),
        }
    }

    /// Consumes the recorded write for `key` and tells whether the event
    /// carries exactly that version.
    fn is_own_write(&self, key: &ObjectKey, resource_version: Option<&str>) -> bool {
        let recorded = match self.own_writes.lock() {
            Ok(mut writes) => writes.remove(key),
            Err(e) => {
                warn!("Failed to look up marker writes for Pod {}: {}", key, e);
                None
            }
        };
        recorded.is_some() && recorded.as_deref() == resource_version
    }
}
