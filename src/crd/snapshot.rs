//! VirtualMachineSnapshot Custom Resource Definition.
//!
//! A snapshot freezes the disk state of every volume attached to a VM at
//! creation time, whether the guest is running or stopped. Once
//! `status.readyToUse` is true the content is immutable. Snapshots carry no
//! owner reference to their VM: deleting the VM must leave them usable.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

/// VirtualMachineSnapshot captures the disk state of a VM at a point in time.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "virtcoord.io",
    version = "v1alpha1",
    kind = "VirtualMachineSnapshot",
    plural = "virtualmachinesnapshots",
    shortname = "vmsnapshot",
    status = "VirtualMachineSnapshotStatus",
    namespaced,
    printcolumn = r#"{"name":"SourceVM", "type":"string", "jsonPath":".spec.source.name"}"#,
    printcolumn = r#"{"name":"ReadyToUse", "type":"boolean", "jsonPath":".status.readyToUse"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotSpec {
    /// The VM whose volumes are snapshotted.
    pub source: SnapshotSource,
}

/// Reference to the snapshotted VM (same namespace as the snapshot).
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSource {
    /// Name of the source VirtualMachine.
    pub name: String,
}

/// Observed state of a VirtualMachineSnapshot.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotStatus {
    /// True once the content freeze has completed. Never reset afterwards,
    /// including after the source VM is deleted.
    #[serde(default)]
    pub ready_to_use: bool,
    /// Lifecycle phase of the snapshot operation.
    #[serde(default)]
    pub phase: SnapshotPhase,
    /// Time the content freeze completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,
    /// One entry per frozen volume.
    #[serde(default)]
    pub volume_backups: Vec<VolumeBackup>,
    /// Status conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Failure detail when phase is Failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A frozen volume inside a snapshot: the claim it came from, the immutable
/// content handle provisioned by the storage backend, and the claim's size
/// at freeze time.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBackup {
    /// Guest volume name.
    pub volume_name: String,
    /// Source PersistentVolumeClaim name.
    pub claim_name: String,
    /// Storage-backend handle of the frozen content. Read-only; restores
    /// look it up but never mutate it.
    pub content_handle: String,
    /// Claim size at freeze time, exact byte count.
    pub size_bytes: u64,
}

/// Lifecycle phase of a snapshot operation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum SnapshotPhase {
    #[default]
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl std::fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotPhase::Pending => write!(f, "Pending"),
            SnapshotPhase::InProgress => write!(f, "InProgress"),
            SnapshotPhase::Succeeded => write!(f, "Succeeded"),
            SnapshotPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl VirtualMachineSnapshot {
    /// Whether the snapshot content is frozen and usable for restore.
    pub fn is_ready_to_use(&self) -> bool {
        self.status.as_ref().map(|s| s.ready_to_use).unwrap_or(false)
    }

    /// The frozen volumes, empty until the snapshot is ready.
    pub fn volume_backups(&self) -> &[VolumeBackup] {
        self.status
            .as_ref()
            .map(|s| s.volume_backups.as_slice())
            .unwrap_or(&[])
    }
}
