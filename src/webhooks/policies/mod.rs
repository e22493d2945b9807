//! Validation policies for VolumeClone admission webhooks.
//!
//! Policies are organized into tiers:
//! - Tier 1 (Critical): Always enforced (clone size floor)
//! - Tier 2 (Update): Only enforced on UPDATE operations (spec immutability)
//!
//! Policies are pure functions over a `ValidationContext`; the server
//! resolves anything that needs the API (the source claim's live size)
//! before invoking them.

pub mod clone_size;
pub mod immutability;

use crate::crd::VolumeClone;

/// Result of a validation check
#[derive(Debug)]
pub struct ValidationResult {
    /// Whether the validation passed
    pub allowed: bool,
    /// Reason for denial (if not allowed)
    pub reason: Option<String>,
    /// Detailed message (if not allowed)
    pub message: Option<String>,
}

impl ValidationResult {
    /// Create an allowed result
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    /// Create a denied result
    pub fn denied(reason: &str, message: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

/// Context for validation
pub struct ValidationContext<'a> {
    /// The clone being validated
    pub clone: &'a VolumeClone,
    /// The old clone (for UPDATE operations)
    pub old_clone: Option<&'a VolumeClone>,
    /// The source claim's current requested size, resolved by the server.
    /// None when the source claim does not exist.
    pub source_size: Option<&'a str>,
    /// Whether this is a dry-run request
    pub dry_run: bool,
    /// The namespace of the resource
    pub namespace: Option<&'a str>,
}

impl<'a> ValidationContext<'a> {
    /// Check if this is an UPDATE operation
    pub fn is_update(&self) -> bool {
        self.old_clone.is_some()
    }
}

/// Run all validation policies
pub fn validate_all(ctx: &ValidationContext<'_>) -> ValidationResult {
    // Tier 1: Critical validations (always enforced)
    let result = clone_size::validate(ctx);
    if !result.allowed {
        return result;
    }

    // Tier 2: Update validations (only for UPDATE operations)
    if ctx.is_update() {
        let result = immutability::validate(ctx);
        if !result.allowed {
            return result;
        }
    }

    ValidationResult::allowed()
}
