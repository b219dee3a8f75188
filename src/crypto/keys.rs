//! Session key derivation
//!
//! Everything is derived from the ephemeral DH shared secret with labelled
//! HMAC-BLAKE2s, so the key-exchange keys, the two data directions, and the
//! two MAC directions are independent of one another.

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::blake2s;

/// Secure session id length
pub const SSID_LEN: usize = 8;

const LABEL_SSID: &[u8] = b"offrecord ake ssid";
const LABEL_C: &[u8] = b"offrecord ake c";
const LABEL_C_PRIME: &[u8] = b"offrecord ake c'";
const LABEL_M1: &[u8] = b"offrecord ake m1";
const LABEL_M1_PRIME: &[u8] = b"offrecord ake m1'";
const LABEL_ENC_HIGH: &[u8] = b"offrecord data-enc-high";
const LABEL_ENC_LOW: &[u8] = b"offrecord data-enc-low";
const LABEL_MAC_HIGH: &[u8] = b"offrecord data-mac-high";
const LABEL_MAC_LOW: &[u8] = b"offrecord data-mac-low";

/// Keys used only while the version 2 key exchange is running
///
/// `c`/`m1` belong to the side that sent the commitment; `c_prime`/`m1_prime`
/// to the side that answered with its DH key.
pub struct AkeKeys {
    pub ssid: [u8; SSID_LEN],
    pub c: Zeroizing<[u8; 32]>,
    pub c_prime: Zeroizing<[u8; 32]>,
    pub m1: Zeroizing<[u8; 32]>,
    pub m1_prime: Zeroizing<[u8; 32]>,
}

impl AkeKeys {
    pub fn derive(shared: &[u8; 32]) -> Self {
        let ssid_full = blake2s::derive(shared, LABEL_SSID);
        let mut ssid = [0u8; SSID_LEN];
        ssid.copy_from_slice(&ssid_full[..SSID_LEN]);

        Self {
            ssid,
            c: Zeroizing::new(blake2s::derive(shared, LABEL_C)),
            c_prime: Zeroizing::new(blake2s::derive(shared, LABEL_C_PRIME)),
            m1: Zeroizing::new(blake2s::derive(shared, LABEL_M1)),
            m1_prime: Zeroizing::new(blake2s::derive(shared, LABEL_M1_PRIME)),
        }
    }
}

/// MAC of the key-exchange transcript from one side's point of view
///
/// This is what the long-term key signs: both ephemeral values, the signer's
/// long-term public key, and the negotiated version.
pub fn transcript_mac(
    mac_key: &[u8; 32],
    own_ephemeral: &[u8; 32],
    peer_ephemeral: &[u8; 32],
    own_long_term: &[u8; 32],
    version: u16,
) -> [u8; 32] {
    blake2s::hmac_parts(
        mac_key,
        &[
            own_ephemeral,
            peer_ephemeral,
            own_long_term,
            &version.to_be_bytes(),
        ],
    )
}

/// Encryption and MAC key for one direction of traffic
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    pub encryption: [u8; 32],
    pub mac: [u8; 32],
}

/// Data-message keys for both directions
pub struct DataKeys {
    pub sending: DirectionKeys,
    pub receiving: DirectionKeys,
}

impl DataKeys {
    /// Derive data keys from the shared secret
    ///
    /// The side whose ephemeral public value is numerically larger sends with
    /// the "high" keys; both sides reach the same assignment independently.
    pub fn derive(shared: &[u8; 32], our_public: &[u8; 32], their_public: &[u8; 32]) -> Self {
        let high = DirectionKeys {
            encryption: blake2s::derive(shared, LABEL_ENC_HIGH),
            mac: blake2s::derive(shared, LABEL_MAC_HIGH),
        };
        let low = DirectionKeys {
            encryption: blake2s::derive(shared, LABEL_ENC_LOW),
            mac: blake2s::derive(shared, LABEL_MAC_LOW),
        };

        if our_public > their_public {
            Self {
                sending: high,
                receiving: low,
            }
        } else {
            Self {
                sending: low,
                receiving: high,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_keys_mirror() {
        let shared = [5u8; 32];
        let a_pub = [1u8; 32];
        let b_pub = [2u8; 32];

        let a = DataKeys::derive(&shared, &a_pub, &b_pub);
        let b = DataKeys::derive(&shared, &b_pub, &a_pub);

        assert_eq!(a.sending.encryption, b.receiving.encryption);
        assert_eq!(a.sending.mac, b.receiving.mac);
        assert_eq!(a.receiving.encryption, b.sending.encryption);
        assert_ne!(a.sending.encryption, a.receiving.encryption);
        assert_ne!(a.sending.encryption, a.sending.mac);
    }

    #[test]
    fn test_ake_keys_independent() {
        let keys = AkeKeys::derive(&[9u8; 32]);
        assert_ne!(*keys.c, *keys.c_prime);
        assert_ne!(*keys.m1, *keys.m1_prime);
        assert_ne!(*keys.c, *keys.m1);
    }

    #[test]
    fn test_transcript_mac_binds_version() {
        let key = [1u8; 32];
        let v1 = transcript_mac(&key, &[2u8; 32], &[3u8; 32], &[4u8; 32], 1);
        let v2 = transcript_mac(&key, &[2u8; 32], &[3u8; 32], &[4u8; 32], 2);
        assert_ne!(v1, v2);

        let swapped = transcript_mac(&key, &[3u8; 32], &[2u8; 32], &[4u8; 32], 2);
        assert_ne!(v2, swapped);
    }
}
