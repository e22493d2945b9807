//! Custom Resource Definitions for vm-storage-coordinator.
//!
//! - `VirtualMachine` / `VirtualMachineInstance`: the managed guest and its
//!   running incarnation
//! - `VirtualMachineSnapshot`: immutable point-in-time disk state
//! - `VirtualMachineRestore`: materialization of a snapshot onto a stopped VM
//! - `VolumeClone`: size-validated clone of an existing claim

mod clone;
mod restore;
mod snapshot;
mod virtual_machine;

pub use clone::*;
pub use restore::*;
pub use snapshot::*;
pub use virtual_machine::*;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group for all coordinator resources.
pub const API_GROUP: &str = "virtcoord.io";

/// Condition describes the state of a resource at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Ready", ready, reason, message, generation)
    }

    /// Create a "Progressing" condition.
    pub fn progressing(
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new("Progressing", progressing, reason, message, generation)
    }
}

/// Check if a condition type is true.
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(|c| c.status == "True")
}

/// Check if a condition type is explicitly false (present and "False").
pub fn is_condition_false(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(|c| c.status == "False")
}

/// Get the reason for a condition.
pub fn get_condition_reason<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a str> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .map(|c| c.reason.as_str())
}
