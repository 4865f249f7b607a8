//! State store access.
//!
//! The reconciler and event mapper only ever need three calls against the
//! cluster: list every PodTracker, read one Pod, and write one Pod back under
//! optimistic concurrency. `ClusterStore` abstracts those calls so the core can
//! be tested without an API server; `KubeStore` is the kube-rs implementation.

use crds::PodTracker;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Namespaced identity of a cluster object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Creates a key from its parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced resource, `None` if it carries no namespace.
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        Some(Self::new(obj.namespace()?, obj.name_any()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Errors surfaced by the state store.
///
/// Only `NotFound` and `Conflict` carry meaning for the core; everything else
/// is treated as transient.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency write lost against a newer resource version
    #[error("conflict: {0}")]
    Conflict(String),

    /// Store unreachable or refused the call
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Any other Kubernetes API failure
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),
}

impl StoreError {
    /// Whether the error means the object is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict(ae.message.clone()),
            other => Self::Kube(other),
        }
    }
}

/// Read/write access to trackers and workloads.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    /// Lists every PodTracker visible to the controller, in listing order.
    async fn list_trackers(&self) -> Result<Vec<PodTracker>, StoreError>;

    /// Reads a pod; `Ok(None)` when it does not exist.
    async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>, StoreError>;

    /// Writes a pod back. The pod's `resourceVersion` guards the write, so a
    /// stale copy fails with [`StoreError::Conflict`].
    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, StoreError>;
}

/// `ClusterStore` backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    /// Creates a store over an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ClusterStore for KubeStore {
    async fn list_trackers(&self) -> Result<Vec<PodTracker>, StoreError> {
        let api: Api<PodTracker> = Api::all(self.client.clone());
        match api.list(&ListParams::default()).await.map_err(StoreError::from) {
            Ok(list) => Ok(list.items),
            // A missing collection (CRD not installed yet) means nothing is configured
            Err(StoreError::NotFound(msg)) => {
                debug!("PodTracker collection not found: {}", msg);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>, StoreError> {
        Ok(self.pods(&key.namespace).get_opt(&key.name).await?)
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        let key = ObjectKey::of(pod)
            .ok_or_else(|| StoreError::NotFound(format!("pod {} has no namespace", pod.name_any())))?;
        Ok(self
            .pods(&key.namespace)
            .replace(&key.name, &PostParams::default(), pod)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn test_object_key_of_pod() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-7f9".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let key = ObjectKey::of(&pod).unwrap();
        assert_eq!(key, ObjectKey::new("default", "web-7f9"));
        assert_eq!(key.to_string(), "default/web-7f9");
    }

    #[test]
    fn test_object_key_requires_namespace() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("orphan".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(ObjectKey::of(&pod).is_none());
    }
}
