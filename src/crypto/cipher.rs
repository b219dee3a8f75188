//! ChaCha20 keystream encryption
//!
//! Used unauthenticated in two places where integrity comes from elsewhere:
//! the DH commitment (checked against the committed hash) and data-message
//! bodies (encrypt-then-MAC, see `protocol::transport`).

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};

/// ChaCha20 key length
pub const KEY_LEN: usize = 32;

/// Apply the ChaCha20 keystream for `counter` to `data`
///
/// Encryption and decryption are the same operation.
pub fn apply_keystream(key: &[u8; KEY_LEN], counter: u64, data: &[u8]) -> Vec<u8> {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_be_bytes());

    let mut cipher = ChaCha20::new(Key::from_slice(key), Nonce::from_slice(&nonce));
    let mut buf = data.to_vec();
    cipher.apply_keystream(&mut buf);
    buf
}
