//! BLAKE2s hashing and HMAC primitives
//!
//! Hashing backs the DH commitment and fingerprints; HMAC-BLAKE2s backs key
//! derivation, the transcript MACs of the key exchange, and data-message MACs.

use blake2::{
    digest::{FixedOutput, KeyInit, Update},
    Blake2s256, Digest,
};
use hmac::SimpleHmac;
use subtle::ConstantTimeEq;

/// Type alias for HMAC-BLAKE2s (RFC 2104 HMAC with BLAKE2s-256)
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// Length of an HMAC-BLAKE2s tag
pub const MAC_LEN: usize = 32;

/// BLAKE2s-256 hash of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// HMAC-BLAKE2s over a single input
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    hmac_parts(key, &[data])
}

/// HMAC-BLAKE2s over the concatenation of several inputs
pub fn hmac_parts(key: &[u8], parts: &[&[u8]]) -> [u8; MAC_LEN] {
    let mut mac = <HmacBlake2s as KeyInit>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    for part in parts {
        Update::update(&mut mac, part);
    }
    mac.finalize_fixed().into()
}

/// Labelled key derivation: HMAC(secret, label)
///
/// Each label yields an independent 32-byte key from the same secret.
pub fn derive(secret: &[u8], label: &[u8]) -> [u8; HASH_LEN] {
    hmac(secret, label)
}

/// Constant-time tag comparison
pub fn tags_equal(expected: &[u8], actual: &[u8]) -> bool {
    expected.len() == actual.len() && bool::from(expected.ct_eq(actual))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash(b"hello"), hash(b"hello"));
        assert_ne!(hash(b"hello"), hash(b"world"));
    }

    #[test]
    fn test_hmac_parts_matches_concatenation() {
        let key = [7u8; 32];
        assert_eq!(hmac_parts(&key, &[b"ab", b"cd"]), hmac(&key, b"abcd"));
    }

    #[test]
    fn test_derive_domain_separation() {
        let secret = [9u8; 32];
        let k1 = derive(&secret, b"label one");
        let k2 = derive(&secret, b"label two");
        assert_ne!(k1, k2);
        assert_eq!(k1, derive(&secret, b"label one"));
    }

    #[test]
    fn test_tags_equal() {
        let tag = hmac(b"key", b"data");
        let mut other = tag;
        assert!(tags_equal(&tag, &other));

        other[31] ^= 1;
        assert!(!tags_equal(&tag, &other));
        assert!(!tags_equal(&tag, &other[..16]));
    }
}
