//! Session context store
//!
//! [`UserState`] owns every session context and every long-term key known to
//! the process. Contexts are keyed by (local account, remote peer, protocol)
//! and each sits behind its own mutex; the table lock is held only for
//! lookup, insert, and remove.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::crypto::signing::{self, LongTermKey, PUBLIC_KEY_LEN};
use crate::crypto::keys::SSID_LEN;
use crate::crypto::{DhGroup, Ed25519KeyPair, X25519Group};
use crate::policy::ProtocolVersion;
use crate::protocol::handshake::{Ake, AkePhase};
use crate::protocol::session::{EpochManager, PREVIOUS_KEY_GRACE};

/// Abandon a key exchange that has not completed within this time
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity triple of one conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId {
    /// Local account name
    pub account: String,
    /// Remote user name
    pub peer: String,
    /// Host protocol tag, e.g. "prpl-oscar"
    pub protocol: String,
}

impl SessionId {
    pub fn new(
        account: impl Into<String>,
        peer: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            peer: peer.into(),
            protocol: protocol.into(),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} ({})", self.account, self.peer, self.protocol)
    }
}

/// Whether outgoing traffic is plaintext, encrypted, or terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Plaintext,
    Encrypted,
    Finished,
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plaintext => "PLAINTEXT",
            Self::Encrypted => "ENCRYPTED",
            Self::Finished => "FINISHED",
        })
    }
}

/// Progress of our whitespace-tag offer to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TagOffer {
    #[default]
    NotSent,
    Sent,
    /// The peer answered tagged plaintext without a tag
    Rejected,
    Accepted,
}

/// Engine tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub handshake_timeout: Duration,
    pub previous_key_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            previous_key_grace: PREVIOUS_KEY_GRACE,
        }
    }
}

/// Per-conversation protocol state
#[derive(Debug)]
pub struct SessionContext {
    pub id: SessionId,
    pub msg_state: MessageState,
    pub ake: Ake,
    pub epochs: EpochManager,
    /// Version of the established keys
    pub version: Option<ProtocolVersion>,
    pub peer_long_term: Option<[u8; PUBLIC_KEY_LEN]>,
    pub ssid: Option<[u8; SSID_LEN]>,
    pub tag_offer: TagOffer,
    /// Reserved for reassembly of fragmented messages
    pub pending_fragments: Vec<String>,
}

impl SessionContext {
    pub fn new(id: SessionId, config: &EngineConfig) -> Self {
        Self {
            id,
            msg_state: MessageState::Plaintext,
            ake: Ake::new(),
            epochs: EpochManager::new(config.previous_key_grace),
            version: None,
            peer_long_term: None,
            ssid: None,
            tag_offer: TagOffer::NotSent,
            pending_fragments: Vec::new(),
        }
    }

    /// Drop all key material and in-flight handshake state
    pub fn clear_keys(&mut self) {
        self.epochs.clear();
        self.ake.reset();
        self.version = None;
        self.ssid = None;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            msg_state: self.msg_state,
            ake_phase: self.ake.phase(),
            version: self.version,
            peer_fingerprint: self.peer_long_term.as_ref().map(signing::fingerprint),
            ssid: self.ssid.map(hex::encode),
        }
    }
}

/// Read-only copy of a session's observable state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub msg_state: MessageState,
    pub ake_phase: AkePhase,
    pub version: Option<ProtocolVersion>,
    pub peer_fingerprint: Option<String>,
    /// Secure session id, hex; equal on both ends of one exchange
    pub ssid: Option<String>,
}

type KeyStore = HashMap<(String, String), Arc<dyn LongTermKey>>;

/// Owner of all session contexts and long-term keys
pub struct UserState {
    contexts: Mutex<HashMap<SessionId, Arc<Mutex<SessionContext>>>>,
    keys: RwLock<KeyStore>,
    group: Box<dyn DhGroup>,
    config: EngineConfig,
}

impl Default for UserState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserState")
            .field("sessions", &lock(&self.contexts).len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl UserState {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_group(Box::new(X25519Group), config)
    }

    pub fn with_group(group: Box<dyn DhGroup>, config: EngineConfig) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            keys: RwLock::new(HashMap::new()),
            group,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn group(&self) -> &dyn DhGroup {
        self.group.as_ref()
    }

    /// Look up a session, creating it in PLAINTEXT if asked to
    pub fn find(&self, id: &SessionId, create: bool) -> Option<SessionSnapshot> {
        let context = if create {
            self.entry(id)
        } else {
            self.get(id)?
        };
        let snapshot = lock(&context).snapshot();
        Some(snapshot)
    }

    pub(crate) fn get(&self, id: &SessionId) -> Option<Arc<Mutex<SessionContext>>> {
        lock(&self.contexts).get(id).cloned()
    }

    /// The session's context, created on first use
    pub(crate) fn entry(&self, id: &SessionId) -> Arc<Mutex<SessionContext>> {
        let mut contexts = lock(&self.contexts);
        let context = contexts.entry(id.clone()).or_insert_with(|| {
            tracing::debug!("Creating session context {}", id);
            Arc::new(Mutex::new(SessionContext::new(id.clone(), &self.config)))
        });
        Arc::clone(context)
    }

    /// Destroy one session context; returns whether it existed
    pub fn forget(&self, id: &SessionId) -> bool {
        let removed = lock(&self.contexts).remove(id);
        if let Some(context) = &removed {
            lock(context).clear_keys();
            tracing::debug!("Forgot session context {}", id);
        }
        removed.is_some()
    }

    /// Destroy every session context
    pub fn forget_all(&self) {
        let drained: Vec<_> = lock(&self.contexts).drain().collect();
        for (_, context) in &drained {
            lock(context).clear_keys();
        }
        tracing::debug!("Forgot {} session contexts", drained.len());
    }

    /// Identity triples of all live sessions
    pub fn sessions(&self) -> Vec<SessionId> {
        lock(&self.contexts).keys().cloned().collect()
    }

    /// Register the long-term key for (account, protocol)
    pub fn add_key(
        &self,
        account: impl Into<String>,
        protocol: impl Into<String>,
        key: Arc<dyn LongTermKey>,
    ) {
        let account = account.into();
        let protocol = protocol.into();
        tracing::info!(
            "Long-term key for {} ({}): {}",
            account,
            protocol,
            signing::fingerprint(&key.public_key())
        );
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((account, protocol), key);
    }

    /// Generate and register a fresh Ed25519 key; returns its public key
    pub fn generate_key(
        &self,
        account: impl Into<String>,
        protocol: impl Into<String>,
    ) -> [u8; PUBLIC_KEY_LEN] {
        let key = Ed25519KeyPair::generate();
        let public = key.public_key();
        self.add_key(account, protocol, Arc::new(key));
        public
    }

    pub fn key_for(&self, account: &str, protocol: &str) -> Option<Arc<dyn LongTermKey>> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(account.to_string(), protocol.to_string()))
            .cloned()
    }
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
