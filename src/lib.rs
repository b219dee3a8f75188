//! offrecord - Off-the-record session layer for instant messaging
//!
//! Adds confidentiality, authentication, and deniability on top of an
//! existing chat transport. The library never touches the network: the host
//! hands it outgoing and incoming text, and it hands back wire text through
//! [`AppCallbacks`].
//!
//! # Features
//!
//! - Authenticated key exchange (four-message v2 and signed v1)
//! - Encrypt-then-MAC data messages with a replay window
//! - Key refresh with a grace window for in-flight messages
//! - MAC-key publication for deniability
//! - Per-account policy: allowed versions, auto-initiation, required encryption
//!
//! # Usage
//!
//! ```no_run
//! use offrecord::{Engine, NoopCallbacks, PolicyTable, Policy, SessionId, UserState};
//!
//! let user_state = UserState::new();
//! user_state.generate_key("alice", "xmpp");
//! let policy = PolicyTable::new(Policy::DEFAULT);
//! let engine = Engine::new(&user_state, &policy, &NoopCallbacks);
//!
//! let session = SessionId::new("alice", "bob", "xmpp");
//! let query = engine.send(&session, "?OTR?")?;
//! assert!(query.starts_with("?OTR"));
//! # Ok::<(), offrecord::OtrError>(())
//! ```

pub mod callbacks;
pub mod config;
pub mod context;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod policy;
pub mod protocol;

pub use callbacks::{Advisory, AppCallbacks, NoopCallbacks, StateChange, TransitionKind, UnreadableReason};
pub use config::HarnessConfig;
pub use context::{EngineConfig, MessageState, SessionId, SessionSnapshot, UserState};
pub use engine::{Engine, Inbound};
pub use error::OtrError;
pub use policy::{Policy, PolicyEvaluator, PolicyTable, ProtocolVersion};
pub use protocol::ExtensionRecord;
