//! VirtualMachine and VirtualMachineInstance Custom Resource Definitions.
//!
//! A VirtualMachine holds the desired guest definition (run strategy plus the
//! set of attached volumes). A VirtualMachineInstance is the running
//! incarnation created by the platform's virtualization controller; the
//! coordinator only reads it to decide whether a guest is running and to
//! address the guest command channel.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

/// VirtualMachine is the desired definition of a guest.
///
/// Example:
/// ```yaml
/// apiVersion: virtcoord.io/v1alpha1
/// kind: VirtualMachine
/// metadata:
///   name: rhel-guest
/// spec:
///   runStrategy: Always
///   volumes:
///     - name: rootdisk
///       claimName: rhel-guest-rootdisk
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "virtcoord.io",
    version = "v1alpha1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    shortname = "vm",
    status = "VirtualMachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.printableStatus"}"#,
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Desired run state of the guest.
    #[serde(default)]
    pub run_strategy: RunStrategy,

    /// Volumes attached to the guest, each backed by a PersistentVolumeClaim.
    #[serde(default)]
    pub volumes: Vec<VolumeReference>,
}

/// A guest volume backed by a PersistentVolumeClaim in the same namespace.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReference {
    /// Device name inside the guest definition.
    pub name: String,
    /// Name of the backing PersistentVolumeClaim.
    pub claim_name: String,
}

/// Desired run state for a VirtualMachine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum RunStrategy {
    /// Guest must not be running.
    #[default]
    Halted,
    /// Guest must always be running.
    Always,
}

/// Observed state of a VirtualMachine.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Human-oriented lifecycle status.
    #[serde(default)]
    pub printable_status: VmPrintableStatus,
    /// True when the guest is running and reachable.
    #[serde(default)]
    pub ready: bool,
    /// Status conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Lifecycle status reported on a VirtualMachine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum VmPrintableStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for VmPrintableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmPrintableStatus::Stopped => write!(f, "Stopped"),
            VmPrintableStatus::Starting => write!(f, "Starting"),
            VmPrintableStatus::Running => write!(f, "Running"),
            VmPrintableStatus::Stopping => write!(f, "Stopping"),
        }
    }
}

impl VirtualMachine {
    /// Whether the guest is fully stopped. Restores may only complete
    /// against a stopped VM, so Starting/Stopping count as not stopped.
    pub fn is_stopped(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.printable_status == VmPrintableStatus::Stopped)
            .unwrap_or(true)
    }

    /// Whether the guest is currently running.
    pub fn is_running(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.printable_status == VmPrintableStatus::Running)
            .unwrap_or(false)
    }
}

/// VirtualMachineInstance is the running incarnation of a VirtualMachine.
///
/// Created and torn down by the virtualization controller; a fresh instance
/// means a fresh guest kernel, which matters for per-boot counters read over
/// the guest channel.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "virtcoord.io",
    version = "v1alpha1",
    kind = "VirtualMachineInstance",
    plural = "virtualmachineinstances",
    shortname = "vmi",
    status = "VirtualMachineInstanceStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node", "type":"string", "jsonPath":".status.nodeName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    /// Name of the owning VirtualMachine.
    pub vm_name: String,
}

/// Observed state of a VirtualMachineInstance.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    /// Lifecycle phase of the instance.
    #[serde(default)]
    pub phase: VmiPhase,
    /// Node hosting the instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// True once the guest agent answers on the command channel.
    #[serde(default)]
    pub guest_agent_connected: bool,
}

/// Lifecycle phase of a VirtualMachineInstance.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum VmiPhase {
    #[default]
    Pending,
    Scheduling,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for VmiPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmiPhase::Pending => write!(f, "Pending"),
            VmiPhase::Scheduling => write!(f, "Scheduling"),
            VmiPhase::Running => write!(f, "Running"),
            VmiPhase::Succeeded => write!(f, "Succeeded"),
            VmiPhase::Failed => write!(f, "Failed"),
        }
    }
}
