//! Clone validation: the size floor rule.
//!
//! A clone may be requested at any size at or above the source claim's
//! CURRENT size. The floor is evaluated against the live size at admission
//! time, not the size the source was created with, so a clone sized to
//! match a claim that has since been expanded is correctly rejected. The
//! rule itself is a pure function; the admission webhook supplies the live
//! source size.

use super::capacity::parse_quantity;
use super::error::{Error, Result};

/// Validate a requested clone size against the source claim's current size.
///
/// Both arguments are Kubernetes quantity strings. Unparseable quantities
/// are rejected. Equal sizes are allowed.
pub fn validate_clone_size(source_current: &str, requested: &str) -> Result<()> {
    let source_bytes = parse_quantity(source_current)
        .map_err(|e| Error::ValidationRejected(format!("source size '{}': {}", source_current, e)))?;
    let requested_bytes = parse_quantity(requested)
        .map_err(|e| Error::ValidationRejected(format!("requested size '{}': {}", requested, e)))?;

    if requested_bytes < source_bytes {
        return Err(Error::ValidationRejected(format!(
            "target resources requests storage size is smaller than the source: {} < {}",
            requested, source_current
        )));
    }
    Ok(())
}
