//! Textual framing on the host's chat channel
//!
//! Four disjoint shapes share the channel with ordinary chat text:
//! - `?OTR:<base64>.` binary protocol messages
//! - `?OTR?`, `?OTRv2?`, `?OTR?v2?` capability queries
//! - `?OTR Error:` protocol errors
//! - plaintext, optionally carrying a whitespace tag that advertises support

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::ProtocolError;
use crate::policy::{ProtocolVersion, VersionSet};

/// Prefix of a binary protocol message
pub const ENVELOPE_PREFIX: &str = "?OTR:";

/// Terminator of a binary protocol message
pub const ENVELOPE_SUFFIX: char = '.';

/// Prefix of a protocol error message
pub const ERROR_PREFIX: &str = "?OTR Error:";

const QUERY_MARKER: &str = "?OTR";

/// 16-byte whitespace base tag
const TAG_BASE: &str = " \t  \t\t\t\t \t \t \t  ";
/// 8-byte whitespace version tags
const TAG_V1: &str = " \t \t  \t ";
const TAG_V2: &str = "  \t\t  \t ";
const TAG_VERSION_LEN: usize = 8;

/// Classified inbound text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming<'a> {
    /// Binary protocol message; the base64 body without prefix or terminator
    Encoded(&'a str),
    /// Capability query advertising these versions
    Query(VersionSet),
    /// Protocol error text from the peer
    Error(&'a str),
    /// Plaintext with the whitespace tag removed
    Tagged { text: String, versions: VersionSet },
    /// Ordinary chat text
    Plain(&'a str),
}

/// Classify a message received from the transport
pub fn classify(text: &str) -> Incoming<'_> {
    if let Some(start) = text.find(ENVELOPE_PREFIX) {
        let body = &text[start + ENVELOPE_PREFIX.len()..];
        return Incoming::Encoded(body);
    }

    if let Some(start) = text.find(ERROR_PREFIX) {
        return Incoming::Error(text[start + ERROR_PREFIX.len()..].trim());
    }

    if let Some(versions) = parse_query(text) {
        return Incoming::Query(versions);
    }

    if let Some((stripped, versions)) = strip_whitespace_tag(text) {
        return Incoming::Tagged {
            text: stripped,
            versions,
        };
    }

    Incoming::Plain(text)
}

/// Wrap binary message bytes for the text channel
pub fn encode(bytes: &[u8]) -> String {
    format!("{}{}{}", ENVELOPE_PREFIX, BASE64.encode(bytes), ENVELOPE_SUFFIX)
}

/// Decode the body returned by [`Incoming::Encoded`]
pub fn decode(body: &str) -> Result<Vec<u8>, ProtocolError> {
    let end = body
        .find(ENVELOPE_SUFFIX)
        .ok_or_else(|| ProtocolError::MalformedEnvelope {
            reason: "missing terminator".to_string(),
        })?;

    BASE64
        .decode(body[..end].trim())
        .map_err(|e| ProtocolError::MalformedEnvelope {
            reason: format!("bad base64: {}", e),
        })
}

/// Does this text contain a capability query?
pub fn is_query(text: &str) -> bool {
    parse_query(text).is_some()
}

/// Parse the versions advertised by a query, if `text` contains one
///
/// `?OTR?` advertises v1, `?OTRv<digits>?` lists versions, and the two forms
/// combine as `?OTR?v2?`. Unknown version digits are ignored.
pub fn parse_query(text: &str) -> Option<VersionSet> {
    let mut search = text;
    while let Some(start) = search.find(QUERY_MARKER) {
        let rest = &search[start + QUERY_MARKER.len()..];
        if let Some(versions) = parse_query_tail(rest) {
            return Some(versions);
        }
        search = rest;
    }
    None
}

fn parse_query_tail(rest: &str) -> Option<VersionSet> {
    let mut versions = VersionSet::NONE;
    let mut matched = false;

    let rest = match rest.strip_prefix('?') {
        Some(after) => {
            versions = versions.with(ProtocolVersion::V1);
            matched = true;
            after
        }
        None => rest,
    };

    if let Some(list) = rest.strip_prefix('v') {
        if let Some(end) = list.find('?') {
            let digits = &list[..end];
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                matched = true;
                for digit in digits.chars() {
                    if let Some(version) = digit
                        .to_digit(10)
                        .and_then(|d| ProtocolVersion::try_from(d as u16).ok())
                    {
                        versions = versions.with(version);
                    }
                }
            }
        }
    }

    matched.then_some(versions)
}

/// The query string advertising `versions`, or `None` if the set is empty
pub fn query_message(versions: VersionSet, account: &str) -> Option<String> {
    let tag = match (
        versions.contains(ProtocolVersion::V1),
        versions.contains(ProtocolVersion::V2),
    ) {
        (true, true) => "?OTR?v2?",
        (false, true) => "?OTRv2?",
        (true, false) => "?OTR?",
        (false, false) => return None,
    };

    Some(format!(
        "{}\n{} has requested an Off-the-Record private conversation. \
         However, you do not have a plugin to support that.",
        tag, account
    ))
}

/// The whitespace tag advertising `versions`
pub fn whitespace_tag(versions: VersionSet) -> String {
    let mut tag = String::from(TAG_BASE);
    if versions.contains(ProtocolVersion::V1) {
        tag.push_str(TAG_V1);
    }
    if versions.contains(ProtocolVersion::V2) {
        tag.push_str(TAG_V2);
    }
    tag
}

/// Remove a whitespace tag from `text`
///
/// Returns the remaining text and the advertised versions, or `None` when no
/// tag is present.
pub fn strip_whitespace_tag(text: &str) -> Option<(String, VersionSet)> {
    let start = text.find(TAG_BASE)?;
    let mut end = start + TAG_BASE.len();
    let mut versions = VersionSet::NONE;

    while let Some(chunk) = text.get(end..end + TAG_VERSION_LEN) {
        if !chunk.chars().all(|c| c == ' ' || c == '\t') {
            break;
        }
        match chunk {
            TAG_V1 => versions = versions.with(ProtocolVersion::V1),
            TAG_V2 => versions = versions.with(ProtocolVersion::V2),
            _ => {}
        }
        end += TAG_VERSION_LEN;
    }

    let mut stripped = String::with_capacity(text.len());
    stripped.push_str(&text[..start]);
    stripped.push_str(&text[end..]);
    Some((stripped, versions))
}

/// A protocol error message carrying `text`
pub fn error_message(text: &str) -> String {
    format!("{} {}", ERROR_PREFIX, text)
}
