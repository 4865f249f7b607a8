//! Annotation constants written onto tracked workloads.

/// API group owning the PodTracker resource
pub const GROUP: &str = "crd.kube.op";

/// Annotation key stamped onto a pod once this controller has claimed it
pub const MARKER_ANNOTATION_KEY: &str = "SourceCRD";

/// Value of the marker annotation (the owning API group)
pub const MARKER_ANNOTATION_VALUE: &str = GROUP;
