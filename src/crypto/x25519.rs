//! X25519 Diffie-Hellman group
//!
//! Provides the ephemeral key agreement behind every key exchange. The engine
//! consumes it through the [`DhGroup`] trait so another group can be plugged
//! in without touching the state machines.

use std::fmt;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// An ephemeral DH key pair; the secret is wiped on drop
#[derive(Clone)]
pub struct EphemeralKeyPair {
    pub secret: Zeroizing<[u8; KEY_LEN]>,
    pub public: [u8; KEY_LEN],
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &hex::encode(&self.public[..8]))
            .finish_non_exhaustive()
    }
}

/// Diffie-Hellman group provider
pub trait DhGroup: Send + Sync {
    /// Generate a fresh ephemeral key pair
    fn generate_keypair(&self) -> EphemeralKeyPair;

    /// Compute the shared secret between our secret and the peer's public value
    fn agree(
        &self,
        secret: &[u8; KEY_LEN],
        peer_public: &[u8; KEY_LEN],
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError>;
}

/// Curve25519 implementation of [`DhGroup`]
#[derive(Debug, Clone, Copy, Default)]
pub struct X25519Group;

impl DhGroup for X25519Group {
    fn generate_keypair(&self) -> EphemeralKeyPair {
        let (secret, public) = generate_keypair();
        EphemeralKeyPair {
            secret: Zeroizing::new(secret),
            public,
        }
    }

    fn agree(
        &self,
        secret: &[u8; KEY_LEN],
        peer_public: &[u8; KEY_LEN],
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
        if !is_valid_public_key(peer_public) {
            return Err(CryptoError::InvalidPublicKey);
        }

        let shared = Zeroizing::new(dh(secret, peer_public));

        // Low-order peer points collapse the shared secret to zero
        if shared.iter().all(|&b| b == 0) {
            return Err(CryptoError::DiffieHellman);
        }

        Ok(shared)
    }
}

/// Generate a new X25519 keypair
///
/// Returns (private_key, public_key)
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Perform X25519 Diffie-Hellman key exchange
pub fn dh(private_key: &[u8; KEY_LEN], public_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    let public = PublicKey::from(*public_key);
    secret.diffie_hellman(&public).to_bytes()
}

/// Check if a public key is usable (rejects the all-zero point)
pub fn is_valid_public_key(key: &[u8; KEY_LEN]) -> bool {
    !key.iter().all(|&b| b == 0)
}
