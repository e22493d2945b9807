//! VirtualMachineRestore Custom Resource Definition.
//!
//! A restore materializes a snapshot's frozen disk state onto its target VM.
//! It references the snapshot by name only: the snapshot may be deleted after
//! the restore completes without affecting the restored VM. A restore created
//! against a running VM parks in InProgress with `complete=false` and both
//! the Ready and Progressing conditions False until the VM is stopped.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

/// VirtualMachineRestore rolls a VM's disks back to a snapshot's content.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "virtcoord.io",
    version = "v1alpha1",
    kind = "VirtualMachineRestore",
    plural = "virtualmachinerestores",
    shortname = "vmrestore",
    status = "VirtualMachineRestoreStatus",
    namespaced,
    printcolumn = r#"{"name":"TargetVM", "type":"string", "jsonPath":".spec.targetName"}"#,
    printcolumn = r#"{"name":"Snapshot", "type":"string", "jsonPath":".spec.snapshotName"}"#,
    printcolumn = r#"{"name":"Complete", "type":"boolean", "jsonPath":".status.complete"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRestoreSpec {
    /// Name of the target VirtualMachine.
    pub target_name: String,
    /// Name of the snapshot to materialize. Weak reference: lookup only.
    pub snapshot_name: String,
}

/// Observed state of a VirtualMachineRestore.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRestoreStatus {
    /// True once every volume has been rolled back and the VM spec points at
    /// the restored claims. Absent or false otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
    /// Lifecycle phase.
    #[serde(default)]
    pub phase: RestorePhase,
    /// Time the restore reached Complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_time: Option<String>,
    /// One entry per volume being restored.
    #[serde(default)]
    pub restores: Vec<VolumeRestore>,
    /// Status conditions (Ready and Progressing).
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Per-volume restore record.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRestore {
    /// Guest volume name.
    pub volume_name: String,
    /// Claim the restored content was materialized into.
    pub claim_name: String,
}

/// Lifecycle phase of a restore operation.
///
/// Created and InProgress are transient; Complete and Failed are terminal.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum RestorePhase {
    #[default]
    Created,
    InProgress,
    Complete,
    Failed,
}

impl RestorePhase {
    /// Whether this phase admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RestorePhase::Complete | RestorePhase::Failed)
    }
}

impl std::fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestorePhase::Created => write!(f, "Created"),
            RestorePhase::InProgress => write!(f, "InProgress"),
            RestorePhase::Complete => write!(f, "Complete"),
            RestorePhase::Failed => write!(f, "Failed"),
        }
    }
}

impl VirtualMachineRestore {
    /// Whether the restore has fully committed.
    pub fn is_complete(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.complete)
            .unwrap_or(false)
    }

    /// Current phase, Created when status has not been written yet.
    pub fn phase(&self) -> RestorePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
