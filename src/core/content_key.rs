//! Content-addressed keys for raw SSZ payloads.
//!
//! A payload is stored under `/blocks/` followed by the unpadded upper-case
//! base32 encoding of the multihash of its 32-byte root, using the
//! keccak-256 multihash code.

use crate::utils::error::{BeaconIndexerError, Result};
use data_encoding::BASE32_NOPAD;

/// Key prefix shared by every content blob.
pub const BLOCKSTORE_PREFIX: &str = "/blocks/";

/// Multihash code for keccak-256.
pub const KECCAK_256_CODE: u8 = 0x1b;

/// Builds the content key for a 32-byte root.
#[must_use]
pub fn content_key(root: &[u8; 32]) -> String {
    let mut multihash = Vec::with_capacity(2 + root.len());
    multihash.push(KECCAK_256_CODE);
    multihash.push(32);
    multihash.extend_from_slice(root);
    format!("{BLOCKSTORE_PREFIX}{}", BASE32_NOPAD.encode(&multihash))
}

/// Decodes a `0x`-prefixed hex root.
///
/// # Errors
///
/// Returns `BeaconIndexerError::DecodingError` if `hex_root` is not 32 bytes of hex.
pub fn parse_root(hex_root: &str) -> Result<[u8; 32]> {
    let raw = hex_root.strip_prefix("0x").unwrap_or(hex_root);
    let bytes = hex::decode(raw)
        .map_err(|e| BeaconIndexerError::DecodingError(format!("invalid root {hex_root}: {e}")))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        BeaconIndexerError::DecodingError(format!(
            "root {hex_root} is {} bytes, expected 32",
            bytes.len()
        ))
    })
}

/// Formats a root the way the beacon API does (`0x` + lower-case hex).
#[must_use]
pub fn format_root(root: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(root))
}

/// Content key for a hex-encoded root.
///
/// # Errors
///
/// Propagates [`parse_root`] failures.
pub fn content_key_for_hex(hex_root: &str) -> Result<String> {
    parse_root(hex_root).map(|root| content_key(&root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_key_zero_root() {
        // 0x1b 0x20 followed by 32 zero bytes.
        let key = content_key(&[0u8; 32]);
        assert_eq!(
            key,
            "/blocks/DMQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
        );
    }

    #[test]
    fn test_content_key_is_deterministic_and_distinct() {
        let a = content_key(&[1u8; 32]);
        let b = content_key(&[2u8; 32]);
        assert_eq!(a, content_key(&[1u8; 32]));
        assert_ne!(a, b);
        assert!(a.starts_with(BLOCKSTORE_PREFIX));
        assert!(!a.contains('='));
    }

    #[test]
    fn test_parse_root() {
        let hex_root = format!("0x{}", "ab".repeat(32));
        let root = parse_root(&hex_root).unwrap();
        assert_eq!(root, [0xab; 32]);
        assert_eq!(format_root(&root), hex_root);
        assert_eq!(
            content_key_for_hex(&hex_root).unwrap(),
            content_key(&[0xab; 32])
        );

        assert!(parse_root("0x1234").is_err());
        assert!(parse_root("0xzz").is_err());
    }
}
