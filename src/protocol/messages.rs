//! Binary message formats
//!
//! Every message starts with a 3-byte header and is carried on the wire
//! inside a `?OTR:` envelope:
//!
//! ```text
//! version(2) | type(1) | body
//! ```
//!
//! Integers are big-endian; variable fields are `len(4) | bytes`.
//!
//! - Type 0x01: Key Exchange (version 1)
//! - Type 0x02: DH Commit
//! - Type 0x03: Data
//! - Type 0x0a: DH Key
//! - Type 0x11: Reveal Signature
//! - Type 0x12: Signature

use crate::crypto::signing::{PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::error::ProtocolError;
use crate::protocol::envelope;

/// Header length: version(2) + type(1)
pub const HEADER_LEN: usize = 3;

/// Message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    KeyExchange = 0x01,
    DhCommit = 0x02,
    Data = 0x03,
    DhKey = 0x0a,
    RevealSignature = 0x11,
    Signature = 0x12,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::KeyExchange),
            0x02 => Ok(Self::DhCommit),
            0x03 => Ok(Self::Data),
            0x0a => Ok(Self::DhKey),
            0x11 => Ok(Self::RevealSignature),
            0x12 => Ok(Self::Signature),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

impl MessageType {
    pub fn name(self) -> &'static str {
        match self {
            Self::KeyExchange => "KeyExchange",
            Self::DhCommit => "DhCommit",
            Self::Data => "Data",
            Self::DhKey => "DhKey",
            Self::RevealSignature => "RevealSignature",
            Self::Signature => "Signature",
        }
    }
}

/// Build the 3-byte header
pub fn header(version: u16, msg_type: MessageType) -> [u8; HEADER_LEN] {
    let v = version.to_be_bytes();
    [v[0], v[1], msg_type as u8]
}

/// Version 1 signed key exchange
///
/// ```text
/// reply(1) | long_term_public(32) | dh_public(32) | signature(64)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchange {
    pub reply: bool,
    pub long_term_public: [u8; PUBLIC_KEY_LEN],
    pub dh_public: [u8; 32],
    pub signature: [u8; SIGNATURE_LEN],
}

/// Commitment to the initiator's DH value
///
/// ```text
/// encrypted_gx(len-prefixed) | hashed_gx(32)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhCommit {
    pub encrypted_gx: Vec<u8>,
    pub hashed_gx: [u8; 32],
}

/// The responder's DH value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhKey {
    pub gy: [u8; 32],
}

/// Reveals the commitment key and carries the initiator's signature block
///
/// ```text
/// revealed_key(32) | signature_block(len-prefixed)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealSignature {
    pub revealed_key: [u8; 32],
    pub signature_block: Vec<u8>,
}

/// The responder's signature block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMessage {
    pub signature_block: Vec<u8>,
}

/// Encrypted data message
///
/// ```text
/// flags(1) | sender_ephemeral(32) | counter(8) | ciphertext(len-prefixed) |
/// mac(32) | revealed_mac_keys(len-prefixed)
/// ```
///
/// The MAC covers the header through the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub flags: u8,
    pub sender_ephemeral: [u8; 32],
    pub counter: u64,
    pub ciphertext: Vec<u8>,
    pub mac: [u8; 32],
    pub revealed_mac_keys: Vec<u8>,
}

impl DataMessage {
    /// Bytes covered by the MAC
    pub fn authenticated_bytes(&self, version: u16) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 1 + 32 + 8 + 4 + self.ciphertext.len());
        buf.extend_from_slice(&header(version, MessageType::Data));
        buf.push(self.flags);
        buf.extend_from_slice(&self.sender_ephemeral);
        buf.extend_from_slice(&self.counter.to_be_bytes());
        put_data(&mut buf, &self.ciphertext);
        buf
    }
}

/// Message body, by type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeyExchange(KeyExchange),
    DhCommit(DhCommit),
    DhKey(DhKey),
    RevealSignature(RevealSignature),
    Signature(SignatureMessage),
    Data(DataMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::KeyExchange(_) => MessageType::KeyExchange,
            Self::DhCommit(_) => MessageType::DhCommit,
            Self::DhKey(_) => MessageType::DhKey,
            Self::RevealSignature(_) => MessageType::RevealSignature,
            Self::Signature(_) => MessageType::Signature,
            Self::Data(_) => MessageType::Data,
        }
    }
}

/// A versioned protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub version: u16,
    pub message: Message,
}

impl WireMessage {
    pub fn new(version: u16, message: Message) -> Self {
        Self { version, message }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        if let Message::Data(data) = &self.message {
            buf.extend_from_slice(&data.authenticated_bytes(self.version));
            buf.extend_from_slice(&data.mac);
            put_data(&mut buf, &data.revealed_mac_keys);
            return buf;
        }

        buf.extend_from_slice(&header(self.version, self.message.message_type()));
        match &self.message {
            Message::KeyExchange(kx) => {
                buf.push(u8::from(kx.reply));
                buf.extend_from_slice(&kx.long_term_public);
                buf.extend_from_slice(&kx.dh_public);
                buf.extend_from_slice(&kx.signature);
            }
            Message::DhCommit(commit) => {
                put_data(&mut buf, &commit.encrypted_gx);
                buf.extend_from_slice(&commit.hashed_gx);
            }
            Message::DhKey(key) => {
                buf.extend_from_slice(&key.gy);
            }
            Message::RevealSignature(reveal) => {
                buf.extend_from_slice(&reveal.revealed_key);
                put_data(&mut buf, &reveal.signature_block);
            }
            Message::Signature(sig) => {
                put_data(&mut buf, &sig.signature_block);
            }
            Message::Data(_) => unreachable!("handled above"),
        }
        buf
    }

    /// Serialize and wrap in the text envelope
    pub fn to_wire(&self) -> String {
        envelope::encode(&self.to_bytes())
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(data);
        let version = reader.u16()?;
        let msg_type = MessageType::try_from(reader.u8()?)?;

        let message = match msg_type {
            MessageType::KeyExchange => {
                let reply = match reader.u8()? {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(ProtocolError::MalformedEnvelope {
                            reason: format!("invalid reply flag {}", other),
                        })
                    }
                };
                Message::KeyExchange(KeyExchange {
                    reply,
                    long_term_public: reader.array()?,
                    dh_public: reader.array()?,
                    signature: reader.array()?,
                })
            }
            MessageType::DhCommit => Message::DhCommit(DhCommit {
                encrypted_gx: reader.data()?.to_vec(),
                hashed_gx: reader.array()?,
            }),
            MessageType::DhKey => Message::DhKey(DhKey {
                gy: reader.array()?,
            }),
            MessageType::RevealSignature => Message::RevealSignature(RevealSignature {
                revealed_key: reader.array()?,
                signature_block: reader.data()?.to_vec(),
            }),
            MessageType::Signature => Message::Signature(SignatureMessage {
                signature_block: reader.data()?.to_vec(),
            }),
            MessageType::Data => Message::Data(DataMessage {
                flags: reader.u8()?,
                sender_ephemeral: reader.array()?,
                counter: reader.u64()?,
                ciphertext: reader.data()?.to_vec(),
                mac: reader.array()?,
                revealed_mac_keys: reader.data()?.to_vec(),
            }),
        };

        reader.finish()?;
        Ok(Self { version, message })
    }

    /// Decode from the base64 body of an envelope
    pub fn from_wire(body: &str) -> Result<Self, ProtocolError> {
        Self::from_bytes(&envelope::decode(body)?)
    }
}

/// Append a length-prefixed field
pub fn put_data(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

/// Bounds-checked cursor over a message body
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if n > self.remaining() {
            return Err(ProtocolError::InvalidMessageLength {
                expected: self.pos + n,
                got: self.data.len(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a `len(4) | bytes` field
    pub fn data(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    /// Fail if bytes are left over
    pub fn finish(self) -> Result<(), ProtocolError> {
        if self.remaining() != 0 {
            return Err(ProtocolError::MalformedEnvelope {
                reason: format!("{} trailing bytes", self.remaining()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_commit_roundtrip() {
        let msg = WireMessage::new(
            2,
            Message::DhCommit(DhCommit {
                encrypted_gx: vec![7u8; 32],
                hashed_gx: [9u8; 32],
            }),
        );

        let bytes = msg.to_bytes();
        assert_eq!(&bytes[..3], &[0, 2, 0x02]);
        assert_eq!(WireMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_data_message_layout() {
        let data = DataMessage {
            flags: 0,
            sender_ephemeral: [1u8; 32],
            counter: 42,
            ciphertext: vec![0xAA; 10],
            mac: [2u8; 32],
            revealed_mac_keys: vec![3u8; 32],
        };
        let msg = WireMessage::new(2, Message::Data(data.clone()));
        let bytes = msg.to_bytes();

        let authenticated = data.authenticated_bytes(2);
        assert!(bytes.starts_with(&authenticated));
        assert_eq!(bytes.len(), authenticated.len() + 32 + 4 + 32);

        let parsed = WireMessage::from_wire(msg.to_wire().strip_prefix("?OTR:").unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_truncated_message() {
        let msg = WireMessage::new(2, Message::DhKey(DhKey { gy: [5u8; 32] }));
        let bytes = msg.to_bytes();

        let result = WireMessage::from_bytes(&bytes[..bytes.len() - 1]);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidMessageLength { .. })
        ));
    }

    #[test]
    fn test_oversized_length_prefix() {
        let mut bytes = header(2, MessageType::Signature).to_vec();
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 8]);

        assert!(WireMessage::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = WireMessage::new(2, Message::DhKey(DhKey { gy: [5u8; 32] })).to_bytes();
        bytes.push(0);
        assert!(matches!(
            WireMessage::from_bytes(&bytes),
            Err(ProtocolError::MalformedEnvelope { .. })
        ));
    }

    #[test]
    fn test_invalid_message_type() {
        let bytes = [0, 2, 0x99];
        assert_eq!(
            WireMessage::from_bytes(&bytes),
            Err(ProtocolError::InvalidMessageType { msg_type: 0x99 })
        );
    }
}
