//! Data-message protection
//!
//! Encrypt-then-MAC: the payload is encrypted with a ChaCha20 keystream keyed
//! by the direction's encryption key and the message counter, then
//! HMAC-BLAKE2s covers the header, the sender's ephemeral value, the counter,
//! and the ciphertext. The MAC is checked before anything is decrypted.

use crate::crypto::keys::DirectionKeys;
use crate::crypto::{blake2s, cipher};
use crate::error::ProtocolError;
use crate::protocol::messages::DataMessage;

/// Maximum counter value before the keys must be replaced
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - 8192;

/// Encrypt and authenticate a payload
pub fn seal(
    keys: &DirectionKeys,
    version: u16,
    sender_ephemeral: [u8; 32],
    counter: u64,
    payload: &[u8],
    revealed_mac_keys: Vec<u8>,
) -> Result<DataMessage, ProtocolError> {
    if counter == 0 || counter >= REJECT_AFTER_MESSAGES {
        return Err(ProtocolError::StaleKeyEpoch);
    }

    let mut message = DataMessage {
        flags: 0,
        sender_ephemeral,
        counter,
        ciphertext: cipher::apply_keystream(&keys.encryption, counter, payload),
        mac: [0u8; 32],
        revealed_mac_keys,
    };
    message.mac = blake2s::hmac(&keys.mac, &message.authenticated_bytes(version));
    Ok(message)
}

/// Check the MAC in constant time
pub fn verify(keys: &DirectionKeys, version: u16, message: &DataMessage) -> Result<(), ProtocolError> {
    let expected = blake2s::hmac(&keys.mac, &message.authenticated_bytes(version));
    if !blake2s::tags_equal(&expected, &message.mac) {
        return Err(ProtocolError::AuthenticationFailure { what: "message MAC" });
    }
    Ok(())
}

/// Anti-replay window for tracking received message counters
///
/// Uses a sliding window bitmap. Counters start at 1, so a zero `highest`
/// means nothing has been received yet.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    /// Highest counter value seen
    highest: u64,
    /// Bit N represents (highest - N) for N in 0..WINDOW_SIZE
    bitmap: u128,
}

/// Size of the anti-replay window in messages
pub const WINDOW_SIZE: u64 = 128;

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest counter still treated as possibly unseen
    pub fn floor(&self) -> u64 {
        self.highest.saturating_sub(WINDOW_SIZE - 1).max(1)
    }

    /// Check that a counter is fresh and mark it as seen
    pub fn check_and_update(&mut self, counter: u64) -> bool {
        if counter == 0 {
            return false;
        }

        if counter > self.highest {
            let shift = counter - self.highest;
            if shift >= WINDOW_SIZE {
                self.bitmap = 1;
            } else {
                self.bitmap = (self.bitmap << shift) | 1;
            }
            self.highest = counter;
            return true;
        }

        let diff = self.highest - counter;
        if diff >= WINDOW_SIZE {
            return false;
        }

        let bit = 1u128 << diff;
        if self.bitmap & bit != 0 {
            false
        } else {
            self.bitmap |= bit;
            true
        }
    }

    /// Check a counter without updating the window
    pub fn would_accept(&self, counter: u64) -> bool {
        if counter == 0 {
            return false;
        }
        if counter > self.highest {
            return true;
        }
        let diff = self.highest - counter;
        diff < WINDOW_SIZE && self.bitmap & (1u128 << diff) == 0
    }
}

/// Both directions of one set of data keys
pub struct DataChannel {
    pub sending: DirectionKeys,
    pub receiving: DirectionKeys,
    /// Counter of the last message sent
    pub sending_counter: u64,
    pub replay_window: ReplayWindow,
}

impl DataChannel {
    pub fn new(sending: DirectionKeys, receiving: DirectionKeys) -> Self {
        Self {
            sending,
            receiving,
            sending_counter: 0,
            replay_window: ReplayWindow::new(),
        }
    }

    /// Seal the next outgoing payload
    pub fn seal(
        &mut self,
        version: u16,
        sender_ephemeral: [u8; 32],
        payload: &[u8],
        revealed_mac_keys: Vec<u8>,
    ) -> Result<DataMessage, ProtocolError> {
        let counter = self.sending_counter + 1;
        let message = seal(
            &self.sending,
            version,
            sender_ephemeral,
            counter,
            payload,
            revealed_mac_keys,
        )?;
        self.sending_counter = counter;
        Ok(message)
    }

    /// Verify, check for replay, and decrypt an incoming message
    ///
    /// The replay window only advances for authenticated messages.
    pub fn open(&mut self, version: u16, message: &DataMessage) -> Result<Vec<u8>, ProtocolError> {
        verify(&self.receiving, version, message)?;

        if !self.replay_window.check_and_update(message.counter) {
            return Err(ProtocolError::ReplayDetected {
                counter: message.counter,
            });
        }

        Ok(cipher::apply_keystream(
            &self.receiving.encryption,
            message.counter,
            &message.ciphertext,
        ))
    }

    pub fn needs_rekey_by_counter(&self) -> bool {
        self.sending_counter >= REJECT_AFTER_MESSAGES - 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(seed: u8) -> DirectionKeys {
        DirectionKeys {
            encryption: [seed; 32],
            mac: [seed.wrapping_add(1); 32],
        }
    }

    fn channel_pair() -> (DataChannel, DataChannel) {
        (
            DataChannel::new(keys(1), keys(3)),
            DataChannel::new(keys(3), keys(1)),
        )
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (mut alice, mut bob) = channel_pair();

        let msg = alice.seal(2, [9u8; 32], b"Hi there", Vec::new()).unwrap();
        assert_eq!(msg.counter, 1);
        assert_ne!(msg.ciphertext, b"Hi there");

        assert_eq!(bob.open(2, &msg).unwrap(), b"Hi there");
    }

    #[test]
    fn test_flipped_bit_rejected() {
        let (mut alice, mut bob) = channel_pair();

        let mut msg = alice.seal(2, [9u8; 32], b"Hi there", Vec::new()).unwrap();
        msg.ciphertext[0] ^= 0x01;

        assert!(matches!(
            bob.open(2, &msg),
            Err(ProtocolError::AuthenticationFailure { .. })
        ));
        // A forged message must not consume the counter
        assert!(bob.replay_window.would_accept(1));
    }

    #[test]
    fn test_mac_binds_ephemeral_and_version() {
        let (mut alice, mut bob) = channel_pair();

        let mut msg = alice.seal(2, [9u8; 32], b"hello", Vec::new()).unwrap();
        assert!(bob.open(1, &msg).is_err());

        msg.sender_ephemeral[0] ^= 0x80;
        assert!(bob.open(2, &msg).is_err());
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = channel_pair();

        let msg = alice.seal(2, [9u8; 32], b"once", Vec::new()).unwrap();
        assert!(bob.open(2, &msg).is_ok());
        assert_eq!(
            bob.open(2, &msg),
            Err(ProtocolError::ReplayDetected { counter: 1 })
        );
    }

    #[test]
    fn test_counter_zero_refused() {
        assert!(seal(&keys(1), 2, [0u8; 32], 0, b"x", Vec::new()).is_err());
        assert!(!ReplayWindow::new().would_accept(0));
    }

    #[test]
    fn test_replay_window_out_of_order() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(5));
        assert!(window.check_and_update(3));
        assert!(window.check_and_update(7));
        assert!(window.check_and_update(4));

        assert!(!window.check_and_update(3));
        assert!(!window.check_and_update(4));
        assert!(!window.check_and_update(5));
        assert!(!window.check_and_update(7));

        // 6 was never seen
        assert!(window.check_and_update(6));
    }

    #[test]
    fn test_replay_window_outside_window() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(200));
        assert_eq!(window.floor(), 200 - WINDOW_SIZE + 1);

        assert!(!window.check_and_update(1));
        assert!(!window.check_and_update(50));
        assert!(window.check_and_update(200 - WINDOW_SIZE + 1));
    }
}
