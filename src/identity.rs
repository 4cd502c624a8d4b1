//! Identity derivation: the 32-byte random seed, the deterministic Ed25519
//! signing keypair, the per-process ephemeral X25519 box keypair, and the
//! address derived from the signing public key.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey, Signature};
use rand::RngCore;
use ripemd::Ripemd160;
use sha2::{Digest, Sha512};
use thiserror::Error;
use x25519_dalek::PublicKey as X25519Public;

use crate::base58check::{self, Base58CheckError};

const SEED_PREFIX: [u8; 2] = [0x49, 0x0a];
const ADDRESS_PREFIX: [u8; 1] = [0x55];

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid seed encoding: {0}")]
    BadSeed(#[from] Base58CheckError),
    #[error("decoded seed is not 32 bytes")]
    WrongSeedLength,
    #[error("invalid address encoding")]
    BadAddress(Base58CheckError),
    #[error("decoded address is not 20 bytes")]
    WrongAddressLength,
}

/// A locally held identity: the reusable signing keypair derived from a
/// persisted seed, plus a box keypair generated fresh for this process.
pub struct Identity {
    seed: [u8; 32],
    signing: SigningKey,
    box_secret: x25519_dalek::StaticSecret,
    box_public: X25519Public,
}

impl Identity {
    /// Generate a brand-new identity: fresh random seed, derived signing
    /// key, and a freshly generated ephemeral box keypair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seed_bytes(seed)
    }

    /// Reconstruct an identity from a previously encoded seed string. The
    /// signing keypair is deterministic; a new ephemeral box keypair is
    /// generated for this process, per spec — box keys are never persisted.
    pub fn from_encoded_seed(encoded: &str) -> Result<Self, IdentityError> {
        let payload = base58check::decode(&SEED_PREFIX, encoded)?;
        let seed: [u8; 32] = payload
            .try_into()
            .map_err(|_| IdentityError::WrongSeedLength)?;
        Ok(Self::from_seed_bytes(seed))
    }

    fn from_seed_bytes(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let box_secret = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
        let box_public = X25519Public::from(&box_secret);
        Self {
            seed,
            signing,
            box_secret,
            box_public,
        }
    }

    /// Encode the seed as `base58check(0x490a || seed32)`.
    pub fn encoded_seed(&self) -> String {
        base58check::encode(&SEED_PREFIX, &self.seed)
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn box_public(&self) -> X25519Public {
        self.box_public
    }

    pub fn box_secret(&self) -> &x25519_dalek::StaticSecret {
        &self.box_secret
    }

    pub fn sign(&self, payload: &[u8]) -> Signature {
        self.signing.sign(payload)
    }

    /// `base58check(0x55 || RIPEMD160(SHA512(signing_pubkey)))`.
    pub fn address(&self) -> String {
        address_of(&self.verifying_key())
    }
}

/// Derive the address string for an arbitrary (peer) signing public key.
pub fn address_of(verifying_key: &VerifyingKey) -> String {
    let hash512 = Sha512::digest(verifying_key.as_bytes());
    let ripemd = Ripemd160::digest(hash512);
    base58check::encode(&ADDRESS_PREFIX, &ripemd)
}

/// Decode an address string back into its raw 20-byte RIPEMD160 digest, for
/// equality checks against freshly derived addresses.
pub fn decode_address(encoded: &str) -> Result<[u8; 20], IdentityError> {
    let payload =
        base58check::decode(&ADDRESS_PREFIX, encoded).map_err(IdentityError::BadAddress)?;
    payload.try_into().map_err(|_| IdentityError::WrongAddressLength)
}

/// Verify a signature over `payload` under `verifying_key`.
pub fn verify(verifying_key: &VerifyingKey, payload: &[u8], signature: &Signature) -> bool {
    verifying_key.verify(payload, signature).is_ok()
}

/// ECDH shared secret between this identity's box key and a peer's box
/// public key.
pub fn shared_secret_with(identity: &Identity, their_box_public: &X25519Public) -> [u8; 32] {
    *identity.box_secret.diffie_hellman(their_box_public).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_roundtrips_through_encoding() {
        let identity = Identity::generate();
        let encoded = identity.encoded_seed();
        let restored = Identity::from_encoded_seed(&encoded).unwrap();
        assert_eq!(identity.seed, restored.seed);
        assert_eq!(identity.verifying_key(), restored.verifying_key());
    }

    #[test]
    fn address_is_deterministic_for_same_seed() {
        let identity = Identity::generate();
        let encoded = identity.encoded_seed();
        let restored = Identity::from_encoded_seed(&encoded).unwrap();
        assert_eq!(identity.address(), restored.address());
    }

    #[test]
    fn box_key_differs_across_instantiations() {
        let identity = Identity::generate();
        let encoded = identity.encoded_seed();
        let restored = Identity::from_encoded_seed(&encoded).unwrap();
        assert_ne!(identity.box_public().as_bytes(), restored.box_public().as_bytes());
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let identity = Identity::generate();
        let sig = identity.sign(b"hello world");
        assert!(verify(&identity.verifying_key(), b"hello world", &sig));
        assert!(!verify(&identity.verifying_key(), b"tampered", &sig));
    }

    #[test]
    fn different_seeds_give_different_addresses() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn decode_address_matches_derivation() {
        let identity = Identity::generate();
        let decoded = decode_address(&identity.address()).unwrap();
        let hash512 = Sha512::digest(identity.verifying_key().as_bytes());
        let expected = Ripemd160::digest(hash512);
        assert_eq!(&decoded[..], &expected[..]);
    }

    proptest::proptest! {
        #[test]
        fn address_is_deterministic_in_the_seed(seed in proptest::prelude::any::<[u8; 32]>()) {
            let a = Identity::from_seed_bytes(seed);
            let b = Identity::from_seed_bytes(seed);
            proptest::prop_assert_eq!(a.address(), b.address());
        }

        #[test]
        fn sign_verify_holds_for_arbitrary_payloads(seed in proptest::prelude::any::<[u8; 32]>(), payload in proptest::prelude::any::<Vec<u8>>()) {
            let identity = Identity::from_seed_bytes(seed);
            let sig = identity.sign(&payload);
            proptest::prop_assert!(verify(&identity.verifying_key(), &payload, &sig));
        }
    }
}
