//! Binary field validation for commitments, nullifiers, and merkle roots
//!
//! These values are computed by the browser-side proof generator and arrive
//! as hex strings on unauthenticated endpoints. Everything that ends up in
//! instruction data must pass through here first; silent truncation of an
//! oversized field is exactly the bug class this module exists to prevent.

use crate::error::RelayerError;

/// Parse a hex string into bytes, enforcing a length range.
///
/// Rejects odd-length input, non-hex characters, and decoded lengths outside
/// `[min_bytes, max_bytes]`. An optional `0x` prefix is accepted.
pub fn parse_hex_field(
    field: &str,
    value: &str,
    min_bytes: usize,
    max_bytes: usize,
) -> Result<Vec<u8>, RelayerError> {
    let trimmed = value.trim();
    let stripped = trimmed.strip_prefix("0x").unwrap_or(trimmed);

    if stripped.len() % 2 != 0 {
        return Err(RelayerError::ValidationFailed(format!(
            "{field}: odd-length hex string"
        )));
    }

    let bytes = hex::decode(stripped)
        .map_err(|_| RelayerError::ValidationFailed(format!("{field}: invalid hex")))?;

    if bytes.len() < min_bytes || bytes.len() > max_bytes {
        return Err(RelayerError::ValidationFailed(format!(
            "{field}: expected {min_bytes}..={max_bytes} bytes, got {}",
            bytes.len()
        )));
    }

    Ok(bytes)
}

/// Convert a byte slice into an exact 32-byte array.
///
/// Anything other than exactly 32 bytes is rejected; undersized input is
/// never padded and oversized input is never truncated.
pub fn to_fixed32(field: &str, bytes: &[u8]) -> Result<[u8; 32], RelayerError> {
    if bytes.len() != 32 {
        return Err(RelayerError::ValidationFailed(format!(
            "{field}: expected exactly 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Parse a hex field that must decode to exactly 32 bytes.
pub fn parse_hex32(field: &str, value: &str) -> Result<[u8; 32], RelayerError> {
    let bytes = parse_hex_field(field, value, 32, 32)?;
    to_fixed32(field, &bytes)
}
