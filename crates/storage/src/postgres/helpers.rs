//! Row conversion helpers shared by the repositories.

use virement_core::error::{StorageError, StorageResult};
use virement_core::models::Address;

/// Convert a BYTEA column into a 20-byte address, naming the field in
/// the error for debuggability.
pub(crate) fn bytes_to_address(bytes: Vec<u8>, field: &str) -> StorageResult<Address> {
    let arr: [u8; 20] = bytes.try_into().map_err(|b: Vec<u8>| {
        StorageError::SerializationError(format!(
            "{field}: expected 20 bytes, got {}",
            b.len()
        ))
    })?;
    Ok(Address(arr))
}

/// Convert a BYTEA column into a 32-byte hash.
pub(crate) fn bytes_to_hash32(bytes: Vec<u8>, field: &str) -> StorageResult<[u8; 32]> {
    bytes.try_into().map_err(|b: Vec<u8>| {
        StorageError::SerializationError(format!(
            "{field}: expected 32 bytes, got {}",
            b.len()
        ))
    })
}

/// Parse a NUMERIC column (selected as TEXT) into a u128.
pub(crate) fn parse_numeric_u128(text: &str, field: &str) -> StorageResult<u128> {
    text.parse::<u128>().map_err(|e| {
        StorageError::SerializationError(format!("{field}: invalid numeric {text:?}: {e}"))
    })
}

/// Parse an optional NUMERIC column into an optional u128.
pub(crate) fn parse_opt_numeric_u128(
    text: Option<String>,
    field: &str,
) -> StorageResult<Option<u128>> {
    text.map(|t| parse_numeric_u128(&t, field)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_conversion_checks_length() {
        assert!(bytes_to_address(vec![0xab; 20], "t").is_ok());

        let err = bytes_to_address(vec![0xab; 32], "from_address").unwrap_err();
        assert!(err.to_string().contains("from_address"));
    }

    #[test]
    fn numeric_parsing() {
        assert_eq!(parse_numeric_u128("0", "t").unwrap(), 0);
        assert_eq!(
            parse_numeric_u128("340282366920938463463374607431768211455", "t").unwrap(),
            u128::MAX
        );
        assert!(parse_numeric_u128("-1", "t").is_err());
        assert!(parse_numeric_u128("1.5", "t").is_err());

        assert_eq!(parse_opt_numeric_u128(None, "t").unwrap(), None);
        assert_eq!(
            parse_opt_numeric_u128(Some("42".into()), "t").unwrap(),
            Some(42)
        );
    }
}
