//! Spec immutability policy (Tier 2 - Update only).
//!
//! A VolumeClone describes a one-shot copy; changing its source or size
//! after submission would make the copy's provenance ambiguous. Both
//! fields are immutable once persisted.

use crate::webhooks::policies::{ValidationContext, ValidationResult};

/// Validate that immutable fields were not changed on UPDATE
pub fn validate(ctx: &ValidationContext<'_>) -> ValidationResult {
    let Some(old) = ctx.old_clone else {
        return ValidationResult::allowed();
    };

    if old.spec.source_claim_name != ctx.clone.spec.source_claim_name {
        return ValidationResult::denied(
            "ImmutableField",
            "spec.sourceClaimName is immutable",
        );
    }
    if old.spec.size != ctx.clone.spec.size {
        return ValidationResult::denied("ImmutableField", "spec.size is immutable");
    }

    ValidationResult::allowed()
}
