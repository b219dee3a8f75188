//! Error types for the offrecord session layer

use thiserror::Error;

/// Main error type for offrecord
#[derive(Error, Debug)]
pub enum OtrError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Accounts file parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid policy flag: {value}")]
    InvalidPolicy { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Duplicate account: {account}")]
    DuplicateAccount { account: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("DH computation failed")]
    DiffieHellman,
}

/// Protocol-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Refused by policy: {reason}")]
    PolicyRefusal { reason: String },

    #[error("Handshake message {message} out of order in state {state}")]
    HandshakeOutOfOrder {
        message: &'static str,
        state: &'static str,
    },

    #[error("Authentication failed: {what}")]
    AuthenticationFailure { what: &'static str },

    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },

    #[error("Message encrypted under a superseded key")]
    StaleKeyEpoch,

    #[error("Replay detected: counter {counter} already seen or too old")]
    ReplayDetected { counter: u64 },

    #[error("Private conversation was ended by the peer")]
    SessionFinished,

    #[error("No long-term key for account {account} ({protocol})")]
    NoKeyPair { account: String, protocol: String },

    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion { version: u16 },

    #[error("Invalid message type: {msg_type:#04x}")]
    InvalidMessageType { msg_type: u8 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },
}

impl From<CryptoError> for ProtocolError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidSignature => ProtocolError::AuthenticationFailure { what: "signature" },
            CryptoError::Decryption => ProtocolError::AuthenticationFailure { what: "ciphertext" },
            CryptoError::InvalidPublicKey | CryptoError::DiffieHellman => {
                ProtocolError::AuthenticationFailure { what: "public key" }
            }
            other => ProtocolError::MalformedEnvelope {
                reason: other.to_string(),
            },
        }
    }
}

impl OtrError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Protocol(ProtocolError::PolicyRefusal { .. }) => {
                "Message not sent: this account requires encryption and no private \
                 conversation is established yet. A private conversation has been requested."
                    .to_string()
            }

            Self::Protocol(ProtocolError::SessionFinished) => {
                "Message not sent: your buddy has closed the private connection.\n  \
                 End your private conversation or refresh it."
                    .to_string()
            }

            Self::Protocol(ProtocolError::NoKeyPair { account, protocol }) => {
                format!(
                    "No private key for {} ({}).\n  Generate or import a key before starting a private conversation.",
                    account, protocol
                )
            }

            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Config(ConfigError::InvalidKey { field }) => {
                format!(
                    "Invalid {} in config. Expected 32-byte base64-encoded key.",
                    field
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Check if this error is recoverable by a protocol retry or user action
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::System(_) => false,

            Self::Protocol(ProtocolError::NoKeyPair { .. }) => false,
            Self::Protocol(_) => true,
            Self::Crypto(_) => true,
        }
    }
}

/// Result type alias for offrecord operations
pub type Result<T> = std::result::Result<T, OtrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_maps_to_authentication_failure() {
        let err: ProtocolError = CryptoError::InvalidSignature.into();
        assert_eq!(err, ProtocolError::AuthenticationFailure { what: "signature" });

        let err: ProtocolError = CryptoError::Decryption.into();
        assert!(matches!(err, ProtocolError::AuthenticationFailure { .. }));
    }

    #[test]
    fn test_recoverable() {
        let err = OtrError::from(ProtocolError::StaleKeyEpoch);
        assert!(err.is_recoverable());

        let err = OtrError::from(ProtocolError::NoKeyPair {
            account: "alice".into(),
            protocol: "xmpp".into(),
        });
        assert!(!err.is_recoverable());
        assert!(err.user_message().contains("alice"));
    }
}
