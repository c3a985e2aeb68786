//! Hex conversions at the RPC and database boundaries.
//!
//! The JSON-RPC wire carries every numeric as a `0x`-prefixed hex string
//! and every address/hash as `0x`-prefixed hex. Numerics are normalized
//! to integers on ingress; addresses are stored as raw bytes (BYTEA) and
//! re-encoded on read.

use bigdecimal::{num_bigint::BigInt, BigDecimal};

use crate::error::AlmanacError;

/// Parse a `0x`-prefixed hex quantity into a u64.
pub fn hex_to_u64(value: &str) -> Result<u64, AlmanacError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.is_empty() {
        return Err(AlmanacError::Hex(format!("empty hex quantity: {value:?}")));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| AlmanacError::Hex(format!("invalid hex quantity {value:?}: {e}")))
}

/// Parse an optional hex quantity; `None`/empty maps to `None`.
pub fn opt_hex_to_u64(value: Option<&str>) -> Result<Option<u64>, AlmanacError> {
    match value {
        None | Some("") => Ok(None),
        Some(v) => hex_to_u64(v).map(Some),
    }
}

/// Parse a hex quantity of arbitrary width into a decimal suitable for a
/// NUMERIC column. Empty input maps to NULL.
pub fn hex_to_decimal(value: &str) -> Result<Option<BigDecimal>, AlmanacError> {
    if value.is_empty() {
        return Ok(None);
    }
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.is_empty() {
        return Err(AlmanacError::Hex(format!("empty hex quantity: {value:?}")));
    }
    let int = BigInt::parse_bytes(digits.as_bytes(), 16)
        .ok_or_else(|| AlmanacError::Hex(format!("invalid hex quantity: {value:?}")))?;
    Ok(Some(BigDecimal::from(int)))
}

/// Render a u64 as a `0x`-prefixed hex quantity.
pub fn u64_to_hex(value: u64) -> String {
    format!("0x{value:x}")
}

/// Decode a `0x`-prefixed address or hash into raw bytes.
///
/// An empty or missing address (contract creation) decodes to a single
/// zero byte so it still lands in a non-null BYTEA column.
pub fn decode_address(address: &str) -> Result<Vec<u8>, AlmanacError> {
    if address.len() < 2 {
        return Ok(vec![0x00]);
    }
    let digits = address.strip_prefix("0x").unwrap_or(address);
    hex::decode(digits).map_err(|e| AlmanacError::Hex(format!("invalid address {address:?}: {e}")))
}

/// Re-encode raw address bytes as `0x`-prefixed lowercase hex.
pub fn encode_address(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}
