//! PodTracker CRD
//!
//! Declares where pod notifications are delivered.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "crd.kube.op",
    version = "v1",
    kind = "PodTracker",
    namespaced,
    status = "PodTrackerStatus",
    shortname = "pt",
    printcolumn = r#"{"name":"Display","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Channel","type":"string","jsonPath":".spec.report.channel"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PodTrackerSpec {
    /// Display label for this tracker
    pub name: String,

    /// Where notifications are delivered
    pub report: Reporter,
}

/// Sink destination for a tracker.
///
/// Both fields are passed to the sink verbatim; the sink is responsible for
/// rejecting malformed credentials.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reporter {
    /// Sink credential (Slack bot token)
    pub key: String,

    /// Sink destination id (Slack channel id or name)
    pub channel: String,
}

/// Observed state of a PodTracker.
///
/// Currently carries no fields; reserved for observed-state reporting.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodTrackerStatus {}
