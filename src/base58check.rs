//! Base58Check envelope: `base58( prefix || payload || checksum )` where
//! `checksum` is the first 4 bytes of `SHA256(SHA256(prefix || payload))`.
//!
//! Bitcoin's Base58Check fixes the version prefix at one byte; this crate's
//! seed envelope uses a two-byte prefix (`0x49 0x0a`), so the checksum is
//! computed by hand rather than via `bs58`'s built-in single-byte
//! `with_check_version`.

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Base58CheckError {
    #[error("invalid base58 encoding")]
    InvalidBase58,
    #[error("payload too short to contain a checksum")]
    TooShort,
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("prefix mismatch: expected {expected:?}, found {found:?}")]
    BadPrefix { expected: Vec<u8>, found: Vec<u8> },
}

fn checksum(data: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 4];
    out.copy_from_slice(&second[..4]);
    out
}

/// Encode `prefix || payload` as Base58Check.
pub fn encode(prefix: &[u8], payload: &[u8]) -> String {
    let mut buf = Vec::with_capacity(prefix.len() + payload.len() + 4);
    buf.extend_from_slice(prefix);
    buf.extend_from_slice(payload);
    let cksum = checksum(&buf);
    buf.extend_from_slice(&cksum);
    bs58::encode(buf).into_string()
}

/// Decode a Base58Check string, verifying the checksum and that it begins
/// with `expected_prefix`. Returns the payload bytes (prefix and checksum
/// stripped).
pub fn decode(expected_prefix: &[u8], encoded: &str) -> Result<Vec<u8>, Base58CheckError> {
    let raw = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| Base58CheckError::InvalidBase58)?;
    if raw.len() < expected_prefix.len() + 4 {
        return Err(Base58CheckError::TooShort);
    }
    let (body, cksum) = raw.split_at(raw.len() - 4);
    if checksum(body) != cksum {
        return Err(Base58CheckError::BadChecksum);
    }
    let (prefix, payload) = body.split_at(expected_prefix.len());
    if prefix != expected_prefix {
        return Err(Base58CheckError::BadPrefix {
            expected: expected_prefix.to_vec(),
            found: prefix.to_vec(),
        });
    }
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn roundtrip() {
        let payload = [1u8; 32];
        let encoded = encode(&[0x49, 0x0a], &payload);
        let decoded = decode(&[0x49, 0x0a], &encoded).unwrap();
        assert_eq!(decoded, payload.to_vec());
    }

    #[test]
    fn wrong_prefix_rejected() {
        let payload = [1u8; 32];
        let encoded = encode(&[0x49, 0x0a], &payload);
        assert!(decode(&[0x55], &encoded).is_err());
    }

    #[test]
    fn tampered_checksum_rejected() {
        let payload = [1u8; 32];
        let mut encoded = encode(&[0x55], &payload);
        encoded.push('x');
        assert!(decode(&[0x55], &encoded).is_err());
    }

    proptest! {
        #[test]
        fn roundtrips_for_any_32_byte_payload(payload in any::<[u8; 32]>()) {
            let encoded = encode(&[0x49, 0x0a], &payload);
            let decoded = decode(&[0x49, 0x0a], &encoded).unwrap();
            prop_assert_eq!(decoded, payload.to_vec());
        }
    }
}
