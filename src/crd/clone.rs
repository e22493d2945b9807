//! VolumeClone Custom Resource Definition.
//!
//! A clone request copies an existing claim's content into a new claim of the
//! requested size. The admission webhook rejects requests smaller than the
//! source claim's current size, so a persisted VolumeClone is always
//! size-valid.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

/// VolumeClone copies the content of an existing claim into a new claim.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "virtcoord.io",
    version = "v1alpha1",
    kind = "VolumeClone",
    plural = "volumeclones",
    shortname = "vclone",
    status = "VolumeCloneStatus",
    namespaced,
    printcolumn = r#"{"name":"Source", "type":"string", "jsonPath":".spec.sourceClaimName"}"#,
    printcolumn = r#"{"name":"Size", "type":"string", "jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCloneSpec {
    /// Source PersistentVolumeClaim in the same namespace.
    pub source_claim_name: String,
    /// Requested size of the clone as a Kubernetes quantity string
    /// (e.g. "20Gi"). Must be at least the source's current size.
    pub size: String,
}

/// Observed state of a VolumeClone.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCloneStatus {
    /// Lifecycle phase of the content copy.
    #[serde(default)]
    pub phase: ClonePhase,
    /// Status conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Lifecycle phase of a clone operation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ClonePhase {
    #[default]
    Pending,
    CopyInProgress,
    Succeeded,
    Failed,
}

impl std::fmt::Display for ClonePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClonePhase::Pending => write!(f, "Pending"),
            ClonePhase::CopyInProgress => write!(f, "CopyInProgress"),
            ClonePhase::Succeeded => write!(f, "Succeeded"),
            ClonePhase::Failed => write!(f, "Failed"),
        }
    }
}
