//! PodTracker CRD Definitions
//!
//! Kubernetes Custom Resource Definitions and shared annotation constants
//! for the pod tracker controller.

pub mod annotations;
pub mod pod_tracker;

pub use annotations::*;
pub use pod_tracker::*;
