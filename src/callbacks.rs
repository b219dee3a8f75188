//! Application callback boundary
//!
//! The only side-effecting surface the engine uses. The engine never touches
//! the network: it hands wire text to [`AppCallbacks::inject_message`] and
//! reports everything else as notifications.

use std::fmt;

use serde::Serialize;

use crate::context::{MessageState, SessionId};
use crate::policy::ProtocolVersion;

/// What kind of message-state transition happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// First private conversation on this session
    GoneSecure { version: ProtocolVersion },
    /// A new key exchange completed while already encrypted
    Refreshed { version: ProtocolVersion },
    /// Back to plaintext through an explicit reset
    GoneInsecure,
    /// The private conversation was ended, by the peer or locally
    Finished { by_peer: bool },
}

/// A single message-state transition notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub session: SessionId,
    pub old: MessageState,
    pub new: MessageState,
    pub kind: TransitionKind,
}

impl StateChange {
    pub fn is_refresh(&self) -> bool {
        matches!(self.kind, TransitionKind::Refreshed { .. })
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransitionKind::GoneSecure { version } => {
                write!(f, "SECURE ({}): {}", version, self.session)
            }
            TransitionKind::Refreshed { version } => {
                write!(f, "REFRESH ({}): {}", version, self.session)
            }
            TransitionKind::GoneInsecure => write!(f, "INSECURE: {}", self.session),
            TransitionKind::Finished { by_peer } => write!(
                f,
                "FINISHED ({}): {}",
                if by_peer { "peer" } else { "local" },
                self.session
            ),
        }
    }
}

/// Why an inbound message could not be read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnreadableReason {
    /// Encrypted data arrived but no private conversation is established
    NotPrivate,
    /// MAC or signature check failed
    AuthenticationFailure,
    /// Encrypted under keys we no longer accept
    StaleKeyEpoch,
    /// Counter already seen or below the replay window
    Replay,
    /// Looked like protocol traffic but could not be decoded
    Malformed,
}

impl fmt::Display for UnreadableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotPrivate => "encrypted message received outside a private conversation",
            Self::AuthenticationFailure => "message failed authentication",
            Self::StaleKeyEpoch => "message encrypted with expired keys",
            Self::Replay => "duplicate or out-of-window message",
            Self::Malformed => "malformed protocol message",
        };
        f.write_str(text)
    }
}

/// Protocol-level advisories with no other recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Advisory {
    /// Plaintext send refused because the policy requires encryption
    EncryptionRequired,
    /// Send refused because the peer ended the private conversation
    SessionFinished,
    /// A plaintext message arrived where encryption was expected
    ReceivedUnencrypted,
    /// The peer sent a protocol error message
    PeerError(String),
    /// A key exchange could not run because the account has no key
    MissingKeyPair,
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncryptionRequired => f.write_str(
                "Attempting to start a private conversation; your message was not sent",
            ),
            Self::SessionFinished => f.write_str(
                "Your buddy has closed the private connection; your message was not sent",
            ),
            Self::ReceivedUnencrypted => f.write_str("The following message was received unencrypted"),
            Self::PeerError(text) => write!(f, "Error from peer: {}", text),
            Self::MissingKeyPair => f.write_str("No private key is available for this account"),
        }
    }
}

/// Host application callbacks
///
/// Every method is required; use [`NoopCallbacks`] for the ones a host does
/// not care about. Callbacks run after the session lock has been released.
pub trait AppCallbacks: Send + Sync {
    /// Transmit `message` from `session.account` to `session.peer`
    fn inject_message(&self, session: &SessionId, message: &str);

    /// A message-state transition happened
    fn state_changed(&self, change: &StateChange);

    /// An inbound message was dropped as unreadable
    fn unreadable_message(&self, session: &SessionId, reason: &UnreadableReason);

    /// Show a protocol-level advisory to the local user
    fn display_advisory(&self, session: &SessionId, advisory: &Advisory);
}

/// Callbacks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl AppCallbacks for NoopCallbacks {
    fn inject_message(&self, _session: &SessionId, _message: &str) {}

    fn state_changed(&self, _change: &StateChange) {}

    fn unreadable_message(&self, _session: &SessionId, _reason: &UnreadableReason) {}

    fn display_advisory(&self, _session: &SessionId, _advisory: &Advisory) {}
}

/// A side effect recorded while a session is locked
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Effect {
    Inject(String),
    StateChanged(StateChange),
    Unreadable(UnreadableReason),
    Advisory(Advisory),
}

/// Effects collected during one engine operation, delivered in order
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    effects: Vec<Effect>,
}

impl Outbox {
    pub fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn inject(&mut self, message: String) {
        self.push(Effect::Inject(message));
    }

    /// Deliver every recorded effect for `session`
    pub fn flush(self, session: &SessionId, app: &dyn AppCallbacks) {
        for effect in self.effects {
            match effect {
                Effect::Inject(message) => app.inject_message(session, &message),
                Effect::StateChanged(change) => app.state_changed(&change),
                Effect::Unreadable(reason) => app.unreadable_message(session, &reason),
                Effect::Advisory(advisory) => app.display_advisory(session, &advisory),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl AppCallbacks for Recorder {
        fn inject_message(&self, _session: &SessionId, message: &str) {
            self.log.lock().unwrap().push(format!("inject {}", message));
        }

        fn state_changed(&self, change: &StateChange) {
            self.log.lock().unwrap().push(change.to_string());
        }

        fn unreadable_message(&self, _session: &SessionId, reason: &UnreadableReason) {
            self.log.lock().unwrap().push(format!("unreadable {}", reason));
        }

        fn display_advisory(&self, _session: &SessionId, advisory: &Advisory) {
            self.log.lock().unwrap().push(format!("advisory {}", advisory));
        }
    }

    #[test]
    fn test_outbox_preserves_order() {
        let session = SessionId::new("alice", "bob", "xmpp");
        let mut outbox = Outbox::default();
        outbox.inject("?OTRv2?".to_string());
        outbox.push(Effect::StateChanged(StateChange {
            session: session.clone(),
            old: MessageState::Plaintext,
            new: MessageState::Encrypted,
            kind: TransitionKind::GoneSecure {
                version: ProtocolVersion::V2,
            },
        }));
        outbox.push(Effect::Unreadable(UnreadableReason::Replay));

        let recorder = Recorder::default();
        outbox.flush(&session, &recorder);

        let log = recorder.log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0], "inject ?OTRv2?");
        assert!(log[1].starts_with("SECURE (v2)"));
        assert!(log[2].starts_with("unreadable"));
    }

    #[test]
    fn test_noop_accepts_everything() {
        let session = SessionId::new("alice", "bob", "xmpp");
        let mut outbox = Outbox::default();
        outbox.push(Effect::Advisory(Advisory::MissingKeyPair));
        outbox.flush(&session, &NoopCallbacks);
    }
}
