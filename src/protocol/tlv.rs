//! Extension records carried inside encrypted data messages
//!
//! Decrypted payload layout:
//!
//! ```text
//! body_len(4) | body (UTF-8) | records*
//! record = type(2) | len(2) | value
//! ```

use serde::Serialize;

use crate::error::ProtocolError;
use crate::protocol::messages::Reader;

/// A tagged, length-prefixed side-channel record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionRecord {
    pub kind: u16,
    pub value: Vec<u8>,
}

impl ExtensionRecord {
    /// Ignored filler used to hide message length
    pub const PADDING: u16 = 0;
    /// The sender has ended the private conversation
    pub const DISCONNECTED: u16 = 1;

    pub fn new(kind: u16, value: Vec<u8>) -> Self {
        Self { kind, value }
    }

    pub fn padding(len: usize) -> Self {
        Self::new(Self::PADDING, vec![0u8; len])
    }

    pub fn disconnected() -> Self {
        Self::new(Self::DISCONNECTED, Vec::new())
    }

    pub fn is_padding(&self) -> bool {
        self.kind == Self::PADDING
    }

    pub fn is_disconnected(&self) -> bool {
        self.kind == Self::DISCONNECTED
    }
}

/// Serialize a message body and its records into a data-message payload
pub fn encode_payload(body: &str, records: &[ExtensionRecord]) -> Result<Vec<u8>, ProtocolError> {
    let records_len: usize = records.iter().map(|r| 4 + r.value.len()).sum();
    let mut buf = Vec::with_capacity(4 + body.len() + records_len);

    let body_len = u32::try_from(body.len()).map_err(|_| ProtocolError::MalformedEnvelope {
        reason: "message body too long".to_string(),
    })?;
    buf.extend_from_slice(&body_len.to_be_bytes());
    buf.extend_from_slice(body.as_bytes());

    for record in records {
        let len = u16::try_from(record.value.len()).map_err(|_| {
            ProtocolError::MalformedEnvelope {
                reason: format!("record type {} longer than 65535 bytes", record.kind),
            }
        })?;
        buf.extend_from_slice(&record.kind.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&record.value);
    }

    Ok(buf)
}

/// Split a decrypted payload into its body and records
///
/// Unknown record types are returned as-is.
pub fn decode_payload(payload: &[u8]) -> Result<(String, Vec<ExtensionRecord>), ProtocolError> {
    let mut reader = Reader::new(payload);
    let body = reader.data().map_err(truncated)?;
    let body = String::from_utf8(body.to_vec()).map_err(|_| ProtocolError::MalformedEnvelope {
        reason: "message body is not UTF-8".to_string(),
    })?;

    let mut records = Vec::new();
    while reader.remaining() > 0 {
        let kind = reader.u16().map_err(truncated)?;
        let len = reader.u16().map_err(truncated)? as usize;
        let value = reader.take(len).map_err(truncated)?.to_vec();
        records.push(ExtensionRecord { kind, value });
    }

    Ok((body, records))
}

fn truncated(_: ProtocolError) -> ProtocolError {
    ProtocolError::MalformedEnvelope {
        reason: "truncated extension record block".to_string(),
    }
}
