//! Cryptographic primitives for the session layer
//!
//! - BLAKE2s hashing, HMAC, and labelled key derivation (blake2s)
//! - ChaCha20-Poly1305 for key-exchange signature blocks (aead)
//! - ChaCha20 keystream for commitments and data bodies (cipher)
//! - Session key derivation (keys)
//! - Long-term Ed25519 identities (signing)
//! - X25519 Diffie-Hellman group (x25519)

pub mod aead;
pub mod blake2s;
pub mod cipher;
pub mod keys;
pub mod signing;
pub mod x25519;

pub use signing::{fingerprint, Ed25519KeyPair, LongTermKey};
pub use x25519::{DhGroup, EphemeralKeyPair, X25519Group};
