//! Long-term identity keys
//!
//! The long-term key only ever signs a MAC of the key-exchange transcript,
//! never message content. [`LongTermKey`] is the seam where a host plugs in
//! its own key storage.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::crypto::blake2s;
use crate::error::CryptoError;

/// Public key length
pub const PUBLIC_KEY_LEN: usize = 32;

/// Signature length
pub const SIGNATURE_LEN: usize = 64;

/// Fingerprint length in bytes (before hex encoding)
const FINGERPRINT_LEN: usize = 20;

/// Signature-capable long-term key pair
pub trait LongTermKey: Send + Sync {
    /// Our public key as sent on the wire
    fn public_key(&self) -> [u8; PUBLIC_KEY_LEN];

    /// Sign `message`
    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN];
}

/// Ed25519 implementation of [`LongTermKey`]
pub struct Ed25519KeyPair {
    signing: SigningKey,
}

impl Ed25519KeyPair {
    /// Generate a fresh key pair
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore a key pair from its 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// The 32-byte seed (for persisting the key)
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }
}

impl fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519KeyPair")
            .field("fingerprint", &fingerprint(&self.public_key()))
            .finish_non_exhaustive()
    }
}

impl LongTermKey for Ed25519KeyPair {
    fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

/// Verify a signature made by the holder of `public_key`
pub fn verify(
    public_key: &[u8; PUBLIC_KEY_LEN],
    message: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature = Signature::from_bytes(signature);
    key.verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Human-comparable fingerprint of a long-term public key
///
/// Five groups of eight hex digits, the way chat clients show them.
pub fn fingerprint(public_key: &[u8; PUBLIC_KEY_LEN]) -> String {
    let digest = blake2s::hash(public_key);
    let hex = hex::encode_upper(&digest[..FINGERPRINT_LEN]);
    hex.as_bytes()
        .chunks(8)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
