//! Exact-byte capacity arithmetic for Kubernetes quantity strings.
//!
//! Claim sizes arrive as human-readable quantities ("1Gi", "500M",
//! "1073741824"). All arithmetic here is checked integer math on byte
//! counts; there is no floating point anywhere, so repeated
//! parse/add/format round-trips cannot drift. Sums are submitted back to
//! the API server as plain byte counts, which every quantity parser
//! accepts.

use thiserror::Error;

/// Errors from quantity parsing and byte arithmetic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapacityError {
    #[error("empty quantity string")]
    Empty,

    #[error("invalid quantity '{0}': no leading digits")]
    NoDigits(String),

    #[error("invalid quantity '{0}': unknown unit suffix '{1}'")]
    UnknownSuffix(String, String),

    #[error("quantity '{0}' overflows the byte counter")]
    Overflow(String),

    #[error("size arithmetic overflow: {0} + {1}")]
    AddOverflow(u64, u64),

    #[error("shrinking a claim is not allowed: {requested} < {current}")]
    Shrink { requested: u64, current: u64 },
}

/// Multiplier for a quantity unit suffix. Binary suffixes are powers of
/// 1024, decimal suffixes powers of 1000, per the Kubernetes quantity
/// grammar.
fn suffix_multiplier(suffix: &str) -> Option<u64> {
    match suffix {
        "" => Some(1),
        "Ki" => Some(1 << 10),
        "Mi" => Some(1 << 20),
        "Gi" => Some(1 << 30),
        "Ti" => Some(1 << 40),
        "Pi" => Some(1 << 50),
        "Ei" => Some(1 << 60),
        "k" => Some(1_000),
        "M" => Some(1_000_000),
        "G" => Some(1_000_000_000),
        "T" => Some(1_000_000_000_000),
        "P" => Some(1_000_000_000_000_000),
        "E" => Some(1_000_000_000_000_000_000),
        _ => None,
    }
}

/// Parse a Kubernetes quantity string into an exact byte count.
///
/// Fractional and milli quantities are rejected: storage sizes are whole
/// bytes.
pub fn parse_quantity(s: &str) -> Result<u64, CapacityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CapacityError::Empty);
    }

    let digits_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if digits_end == 0 {
        return Err(CapacityError::NoDigits(s.to_string()));
    }

    let (digits, suffix) = s.split_at(digits_end);
    let value: u64 = digits
        .parse()
        .map_err(|_| CapacityError::Overflow(s.to_string()))?;
    let multiplier = suffix_multiplier(suffix)
        .ok_or_else(|| CapacityError::UnknownSuffix(s.to_string(), suffix.to_string()))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| CapacityError::Overflow(s.to_string()))
}

/// Format an exact byte count as a quantity string.
///
/// Always emits the plain byte count: lossless, and accepted by the API
/// server for any size field.
pub fn format_bytes(bytes: u64) -> String {
    bytes.to_string()
}

/// Add a byte delta to a quantity string, returning the exact new byte count.
pub fn add_bytes(current: &str, delta: u64) -> Result<u64, CapacityError> {
    let base = parse_quantity(current)?;
    base.checked_add(delta)
        .ok_or(CapacityError::AddOverflow(base, delta))
}

/// Byte delta that grows `current` to `requested`.
///
/// Claim sizes only ever grow: a requested size below the current one is
/// rejected here, before any API write.
pub fn grow_delta(current: u64, requested: u64) -> Result<u64, CapacityError> {
    if requested < current {
        return Err(CapacityError::Shrink { requested, current });
    }
    Ok(requested - current)
}
