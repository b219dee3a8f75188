//! Session protocol implementation
//!
//! This module contains the core protocol components:
//! - Text framing on the chat channel (envelope)
//! - Binary message formats (messages)
//! - Extension records (tlv)
//! - Authenticated key exchange (handshake)
//! - Data-message protection and replay window (transport)
//! - Key epochs (session)

pub mod envelope;
pub mod handshake;
pub mod messages;
pub mod session;
pub mod tlv;
pub mod transport;

pub use envelope::Incoming;
pub use handshake::{Ake, AkeContext, AkeOutcome, AkePhase, Established};
pub use messages::{DataMessage, Message, MessageType, WireMessage};
pub use session::{EpochManager, KeyEpoch};
pub use tlv::ExtensionRecord;
pub use transport::{DataChannel, ReplayWindow};
