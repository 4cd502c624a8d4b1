//! Signed and box envelope wire forms. The signed envelope is `{s, p}`
//! where `p` is the byte-identical payload string that was signed — the
//! implementation MUST sign and verify over that exact string, not a
//! re-serialization of it.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use thiserror::Error;
use x25519_dalek::PublicKey as X25519Public;

use crate::crypto::{self, CryptoError};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload is not valid UTF-8 JSON")]
    BadPayload,
    #[error("signature does not verify")]
    BadSignature,
    #[error("hex decoding failed")]
    BadHex,
    #[error("signature bytes are malformed")]
    BadSignatureBytes,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Application-level payload carried by a signed envelope. `y` is the
/// discriminant; unused fields for a given `y` are simply absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub t: i64,
    pub i: String,
    pub pk: String,
    pub ek: String,
    pub n: String,
    pub y: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rr: Option<serde_json::Value>,
}

impl Payload {
    pub fn nonce() -> String {
        let mut bytes = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

/// Wire form of a signed envelope: `{s: hex signature, p: payload JSON string}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub s: String,
    pub p: String,
}

impl SignedEnvelope {
    /// Serialize `payload` to its canonical JSON string, sign that exact
    /// string, and wrap it.
    pub fn sign(signing_key: &SigningKey, payload: &Payload) -> Self {
        let payload_str = serde_json::to_string(payload).expect("payload always serializes");
        let signature = signing_key.sign(payload_str.as_bytes());
        SignedEnvelope {
            s: hex::encode(signature.to_bytes()),
            p: payload_str,
        }
    }

    /// Verify the signature against `pk` (as encoded in the payload) over
    /// the byte-identical `p` string, then parse `p` as a [`Payload`].
    pub fn verify_and_parse(&self, verifying_key: &VerifyingKey) -> Result<Payload, EnvelopeError> {
        let sig_bytes = hex::decode(&self.s).map_err(|_| EnvelopeError::BadHex)?;
        let sig_array: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| EnvelopeError::BadSignatureBytes)?;
        let signature = Signature::from_bytes(&sig_array);
        verifying_key
            .verify(self.p.as_bytes(), &signature)
            .map_err(|_| EnvelopeError::BadSignature)?;
        serde_json::from_str(&self.p).map_err(|_| EnvelopeError::BadPayload)
    }

    /// Self-describing verification: parse `p` to recover the claimed
    /// signing key (`pk`), then verify the signature of `p` against that
    /// key. Returns the verifying key alongside the payload so the caller
    /// can cross-check it against an expected address.
    pub fn verify_self(&self) -> Result<(VerifyingKey, Payload), EnvelopeError> {
        let unverified: Payload = serde_json::from_str(&self.p).map_err(|_| EnvelopeError::BadPayload)?;
        let verifying_key = decode_verifying_key(&unverified.pk)?;
        let payload = self.verify_and_parse(&verifying_key)?;
        Ok((verifying_key, payload))
    }
}

/// Plain (non-checksummed) base58 encoding used for the `pk`/`ek` payload
/// fields — these are ephemeral/per-session keys, not the persisted seed or
/// address, so they carry no checksum envelope.
pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    bs58::encode(key.as_bytes()).into_string()
}

pub fn decode_verifying_key(encoded: &str) -> Result<VerifyingKey, EnvelopeError> {
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| EnvelopeError::BadHex)?;
    let array: [u8; 32] = bytes.try_into().map_err(|_| EnvelopeError::BadSignatureBytes)?;
    VerifyingKey::from_bytes(&array).map_err(|_| EnvelopeError::BadSignatureBytes)
}

pub fn encode_box_public(key: &X25519Public) -> String {
    bs58::encode(key.as_bytes()).into_string()
}

pub fn decode_box_public(encoded: &str) -> Result<X25519Public, EnvelopeError> {
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| EnvelopeError::BadHex)?;
    let array: [u8; 32] = bytes.try_into().map_err(|_| EnvelopeError::BadSignatureBytes)?;
    Ok(X25519Public::from(array))
}

/// Wire form of a directed box envelope: `{n: hex nonce, ek: sender box
/// pub (base58), e: hex ciphertext}`. The ciphertext wraps a serialized
/// [`SignedEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxEnvelope {
    pub n: String,
    pub ek: String,
    pub e: String,
}

impl BoxEnvelope {
    /// Seal `inner` (a signed envelope, itself already serialized to JSON)
    /// for `recipient_box_pub` using an ephemeral keypair bound into the
    /// sealed bytes as `n`/`ek`.
    pub fn seal(
        inner_json: &[u8],
        sender_box_public: &X25519Public,
        shared_secret: &[u8; 32],
    ) -> Result<Self, EnvelopeError> {
        let sealed = crypto::seal(shared_secret, inner_json)?;
        Ok(BoxEnvelope {
            n: hex::encode(&sealed[..24]),
            ek: bs58::encode(sender_box_public.as_bytes()).into_string(),
            e: hex::encode(&sealed[24..]),
        })
    }

    /// Open this envelope with the recipient's shared secret, returning the
    /// inner signed-envelope bytes.
    pub fn open(&self, shared_secret: &[u8; 32]) -> Result<Vec<u8>, EnvelopeError> {
        let nonce = hex::decode(&self.n).map_err(|_| EnvelopeError::BadHex)?;
        let ciphertext = hex::decode(&self.e).map_err(|_| EnvelopeError::BadHex)?;
        let mut sealed = Vec::with_capacity(nonce.len() + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(crypto::open(shared_secret, &sealed)?)
    }
}

/// `SHA512(bytes)` truncated to the first 16 bytes — the packet dedup hash.
pub fn packet_hash(bytes: &[u8]) -> [u8; 16] {
    let digest = Sha512::digest(bytes);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}
