//! Clone size validation policy (Tier 1 - Critical).
//!
//! Rejects clone requests smaller than the source claim's current size.
//! The floor is the live size at admission time: a source that was
//! expanded after creation raises the floor with it. Evaluated
//! synchronously at admission, so an undersized clone is never persisted.

use crate::coordinator::validate_clone_size;
use crate::webhooks::policies::{ValidationContext, ValidationResult};

/// Validate the requested clone size against the source claim
pub fn validate(ctx: &ValidationContext<'_>) -> ValidationResult {
    let Some(source_size) = ctx.source_size else {
        return ValidationResult::denied(
            "SourceNotFound",
            &format!(
                "source claim '{}' not found",
                ctx.clone.spec.source_claim_name
            ),
        );
    };

    match validate_clone_size(source_size, &ctx.clone.spec.size) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => ValidationResult::denied("CloneSizeTooSmall", &e.to_string()),
    }
}
