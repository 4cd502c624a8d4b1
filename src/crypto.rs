//! Shared Curve25519 / AEAD helpers used by the signed channel and the
//! encrypted overlay: Ed25519↔X25519 conversion, ECDH shared-secret
//! derivation, and the XChaCha20-Poly1305 box used for directed envelopes
//! and overlay payload encryption.

use chacha20poly1305::{
    aead::Aead, AeadCore, KeyInit, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("box encryption failed")]
    Encrypt,
    #[error("box decryption failed — wrong key or tampered ciphertext")]
    Decrypt,
    #[error("ciphertext too short to contain a nonce")]
    Truncated,
}

/// Convert a 32-byte Ed25519 seed to an X25519 static secret.
/// Uses SHA-512/clamp derivation (RFC 7748 §5).
pub fn ed25519_seed_to_x25519(seed_bytes: &[u8; 32]) -> StaticSecret {
    let hash = Sha512::digest(seed_bytes);
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash[..32]);
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    StaticSecret::from(key)
}

/// Convert a 32-byte Ed25519 compressed public key to X25519 Montgomery form.
pub fn ed25519_pubkey_to_x25519(pubkey_bytes: &[u8; 32]) -> X25519Public {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY(*pubkey_bytes);
    let point = compressed
        .decompress()
        .unwrap_or_default();
    X25519Public::from(point.to_montgomery().to_bytes())
}

/// Derive a 32-byte AEAD key from an X25519 shared secret, binding it to the
/// exchange with `salt` (usually the ephemeral or sender public key) and a
/// domain-separation `info` string.
pub fn derive_aead_key(shared: &[u8; 32], salt: &[u8; 32], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);
    let mut key = [0u8; 32];
    hk.expand(info, &mut key).expect("HKDF output length is valid");
    key
}

/// Seal `plaintext` under a 32-byte symmetric key with a fresh random nonce.
/// Wire form: `nonce[24] || ciphertext`.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(24 + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal`].
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < 24 {
        return Err(CryptoError::Truncated);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(24);
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    let nonce = XNonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

/// Ephemeral X25519 keypair plus the shared secret it derives with a peer's
/// static public key — used for the directed box envelope (one-shot,
/// never-reused ephemeral key per send).
pub fn ephemeral_shared_secret(their_public: &X25519Public) -> (X25519Public, [u8; 32]) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    let shared = secret.diffie_hellman(their_public);
    (public, *shared.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [7u8; 32];
        let ct = seal(&key, b"hello").unwrap();
        assert_eq!(open(&key, &ct).unwrap(), b"hello");
    }

    #[test]
    fn wrong_key_fails() {
        let key = [7u8; 32];
        let other = [8u8; 32];
        let ct = seal(&key, b"hello").unwrap();
        assert!(open(&other, &ct).is_err());
    }

    #[test]
    fn ed25519_to_x25519_is_deterministic() {
        let seed = [3u8; 32];
        let a = ed25519_seed_to_x25519(&seed);
        let b = ed25519_seed_to_x25519(&seed);
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn ecdh_shared_secret_matches_both_directions() {
        let seed_a = [1u8; 32];
        let seed_b = [2u8; 32];
        let sa = ed25519_seed_to_x25519(&seed_a);
        let sb = ed25519_seed_to_x25519(&seed_b);
        let pa = X25519Public::from(&sa);
        let pb = X25519Public::from(&sb);
        assert_eq!(sa.diffie_hellman(&pb).as_bytes(), sb.diffie_hellman(&pa).as_bytes());
    }

    proptest::proptest! {
        #[test]
        fn seal_open_roundtrips_for_any_key_and_plaintext(
            key in proptest::prelude::any::<[u8; 32]>(),
            plaintext in proptest::prelude::any::<Vec<u8>>(),
        ) {
            let ct = seal(&key, &plaintext).unwrap();
            proptest::prop_assert_eq!(open(&key, &ct).unwrap(), plaintext);
        }

        #[test]
        fn ecdh_then_seal_roundtrips_across_both_parties(
            seed_a in proptest::prelude::any::<[u8; 32]>(),
            seed_b in proptest::prelude::any::<[u8; 32]>(),
            plaintext in proptest::prelude::any::<Vec<u8>>(),
        ) {
            let sa = ed25519_seed_to_x25519(&seed_a);
            let sb = ed25519_seed_to_x25519(&seed_b);
            let pa = X25519Public::from(&sa);
            let pb = X25519Public::from(&sb);
            let shared_a = *sa.diffie_hellman(&pb).as_bytes();
            let shared_b = *sb.diffie_hellman(&pa).as_bytes();

            let ct = seal(&shared_a, &plaintext).unwrap();
            proptest::prop_assert_eq!(open(&shared_b, &ct).unwrap(), plaintext);
        }
    }
}
