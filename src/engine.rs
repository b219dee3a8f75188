//! Message-state machine and wire transform
//!
//! [`Engine`] is the host-facing surface: `send` turns outgoing user text into
//! wire text according to policy and message state, `receive` classifies
//! incoming wire text and either advances the key exchange, decrypts a data
//! message, or passes plaintext through.
//!
//! All work for one session happens under that session's lock. Callbacks are
//! collected in an outbox and delivered after the lock is released.

use std::sync::Mutex;

use serde::Serialize;

use crate::callbacks::{
    Advisory, AppCallbacks, Effect, Outbox, StateChange, TransitionKind, UnreadableReason,
};
use crate::context::{
    lock, MessageState, SessionContext, SessionId, SessionSnapshot, TagOffer, UserState,
};
use crate::crypto::LongTermKey;
use crate::error::{OtrError, ProtocolError, Result};
use crate::policy::{Policy, PolicyEvaluator, ProtocolVersion};
use crate::protocol::envelope::{self, Incoming};
use crate::protocol::handshake::{AkeContext, Established};
use crate::protocol::messages::{DataMessage, Message, WireMessage};
use crate::protocol::session::KeyEpoch;
use crate::protocol::tlv::{self, ExtensionRecord};

/// Result of receiving one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Inbound {
    /// Text to show the user
    Message {
        text: String,
        records: Vec<ExtensionRecord>,
        /// False when the text arrived in the clear
        encrypted: bool,
    },
    /// Protocol-internal; nothing to show
    Ignored,
    /// Dropped; also reported through `unreadable_message`
    Unreadable(UnreadableReason),
}

impl Inbound {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Message { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// Session engine bound to a user state, a policy, and host callbacks
pub struct Engine<'a> {
    user_state: &'a UserState,
    policy: &'a dyn PolicyEvaluator,
    app: &'a dyn AppCallbacks,
}

impl<'a> Engine<'a> {
    pub fn new(
        user_state: &'a UserState,
        policy: &'a dyn PolicyEvaluator,
        app: &'a dyn AppCallbacks,
    ) -> Self {
        Self {
            user_state,
            policy,
            app,
        }
    }

    pub fn user_state(&self) -> &UserState {
        self.user_state
    }

    /// Run `op` on the session's context under its lock, then deliver effects
    fn with_session<T>(
        &self,
        id: &SessionId,
        op: impl FnOnce(&mut SessionContext, &mut Outbox) -> T,
    ) -> T {
        let context = self.user_state.entry(id);
        self.run_locked(id, &context, op)
    }

    /// Like `with_session`, but never creates the context
    fn with_existing_session<T>(
        &self,
        id: &SessionId,
        op: impl FnOnce(&mut SessionContext, &mut Outbox) -> T,
    ) -> Option<T> {
        let context = self.user_state.get(id)?;
        Some(self.run_locked(id, &context, op))
    }

    fn run_locked<T>(
        &self,
        id: &SessionId,
        context: &Mutex<SessionContext>,
        op: impl FnOnce(&mut SessionContext, &mut Outbox) -> T,
    ) -> T {
        let mut outbox = Outbox::default();
        let result = {
            let mut ctx = lock(context);
            self.expire_stalled(&mut ctx);
            op(&mut ctx, &mut outbox)
        };
        outbox.flush(id, self.app);
        result
    }

    fn expire_stalled(&self, ctx: &mut SessionContext) {
        if ctx.ake.timed_out(self.user_state.config().handshake_timeout) {
            tracing::debug!("Key exchange with {} timed out in {}", ctx.id, ctx.ake.phase());
            ctx.ake.reset();
        }
    }

    /// Prepare `text` for transmission to `id.peer`
    ///
    /// Returns the wire text the host must send, or an error when the
    /// message must not go out at all.
    pub fn send(&self, id: &SessionId, text: &str) -> Result<String> {
        self.send_with_records(id, text, &[])
    }

    /// Like [`Engine::send`], carrying extension records when encrypted
    pub fn send_with_records(
        &self,
        id: &SessionId,
        text: &str,
        records: &[ExtensionRecord],
    ) -> Result<String> {
        let policy = self.policy.policy(&id.account);
        self.with_session(id, |ctx, outbox| {
            self.send_locked(ctx, policy, text, records, outbox)
        })
    }

    fn send_locked(
        &self,
        ctx: &mut SessionContext,
        policy: Policy,
        text: &str,
        records: &[ExtensionRecord],
        outbox: &mut Outbox,
    ) -> Result<String> {
        if envelope::is_query(text) {
            return envelope::query_message(policy.versions(), &ctx.id.account).ok_or_else(|| {
                ProtocolError::PolicyRefusal {
                    reason: "no protocol version allowed".to_string(),
                }
                .into()
            });
        }

        match ctx.msg_state {
            MessageState::Plaintext => {
                if policy.requires_encryption() {
                    tracing::info!("Refusing plaintext send on {}: encryption required", ctx.id);
                    outbox.push(Effect::Advisory(Advisory::EncryptionRequired));
                    if !ctx.ake.in_progress() {
                        if let Some(query) =
                            envelope::query_message(policy.versions(), &ctx.id.account)
                        {
                            outbox.inject(query);
                        }
                    }
                    return Err(ProtocolError::PolicyRefusal {
                        reason: "encryption required".to_string(),
                    }
                    .into());
                }

                if !records.is_empty() {
                    tracing::debug!("Dropping {} records from plaintext send", records.len());
                }

                let versions = policy.versions();
                if policy.auto_initiates()
                    && !versions.is_empty()
                    && ctx.tag_offer != TagOffer::Rejected
                {
                    ctx.tag_offer = TagOffer::Sent;
                    return Ok(format!("{}{}", text, envelope::whitespace_tag(versions)));
                }
                Ok(text.to_string())
            }
            MessageState::Encrypted => {
                let message = seal(ctx, text, records)?;
                if let (true, Some(version)) = (sending_exhausted(ctx), ctx.version) {
                    tracing::info!("Sending counter for {} nearly exhausted; refreshing keys", ctx.id);
                    self.start_ake(ctx, policy, version, outbox);
                }
                Ok(message.to_wire())
            }
            MessageState::Finished => {
                outbox.push(Effect::Advisory(Advisory::SessionFinished));
                Err(ProtocolError::SessionFinished.into())
            }
        }
    }

    /// Process wire text received from `id.peer`
    pub fn receive(&self, id: &SessionId, text: &str) -> Inbound {
        let policy = self.policy.policy(&id.account);
        self.with_session(id, |ctx, outbox| {
            self.receive_locked(ctx, policy, text, outbox)
        })
    }

    fn receive_locked(
        &self,
        ctx: &mut SessionContext,
        policy: Policy,
        text: &str,
        outbox: &mut Outbox,
    ) -> Inbound {
        if policy.versions().is_empty() {
            return Inbound::Message {
                text: text.to_string(),
                records: Vec::new(),
                encrypted: false,
            };
        }

        match envelope::classify(text) {
            Incoming::Encoded(body) => match WireMessage::from_wire(body) {
                Ok(WireMessage {
                    version,
                    message: Message::Data(data),
                }) => self.receive_data(ctx, version, &data, outbox),
                Ok(message) => self.receive_ake(ctx, policy, &message, outbox),
                Err(e) => {
                    tracing::debug!("Undecodable protocol message on {}: {}", ctx.id, e);
                    unreadable(UnreadableReason::Malformed, outbox)
                }
            },
            Incoming::Query(theirs) => {
                let common = policy.versions().intersect(&theirs);
                match common.best() {
                    Some(version) => self.start_ake(ctx, policy, version, outbox),
                    None => tracing::debug!("No common protocol version with {}", ctx.id),
                }
                Inbound::Ignored
            }
            Incoming::Error(message) => {
                tracing::warn!("Error from {}: {}", ctx.id, message);
                outbox.push(Effect::Advisory(Advisory::PeerError(message.to_string())));
                Inbound::Ignored
            }
            Incoming::Tagged { text, versions } => {
                if ctx.tag_offer == TagOffer::Sent {
                    ctx.tag_offer = TagOffer::Accepted;
                }
                let common = policy.versions().intersect(&versions);
                if policy.auto_initiates()
                    && ctx.msg_state == MessageState::Plaintext
                    && !ctx.ake.in_progress()
                {
                    if let Some(version) = common.best() {
                        self.start_ake(ctx, policy, version, outbox);
                    }
                }
                received_plaintext(ctx, policy, text, outbox)
            }
            Incoming::Plain(text) => {
                if ctx.tag_offer == TagOffer::Sent {
                    ctx.tag_offer = TagOffer::Rejected;
                }
                received_plaintext(ctx, policy, text.to_string(), outbox)
            }
        }
    }

    fn ake_context<'c>(
        &self,
        policy: Policy,
        identity: &'c dyn LongTermKey,
    ) -> AkeContext<'c>
    where
        'a: 'c,
    {
        let user_state: &'a UserState = self.user_state;
        AkeContext {
            group: user_state.group(),
            identity,
            allowed: policy.versions(),
        }
    }

    fn start_ake(
        &self,
        ctx: &mut SessionContext,
        policy: Policy,
        version: ProtocolVersion,
        outbox: &mut Outbox,
    ) {
        let Some(identity) = self.user_state.key_for(&ctx.id.account, &ctx.id.protocol) else {
            tracing::warn!("No long-term key for {}; cannot start key exchange", ctx.id);
            outbox.push(Effect::Advisory(Advisory::MissingKeyPair));
            return;
        };

        tracing::debug!("Starting {} key exchange with {}", version, ctx.id);
        let ake_ctx = self.ake_context(policy, identity.as_ref());
        let message = ctx.ake.start(version, &ake_ctx);
        outbox.inject(message.to_wire());
    }

    fn receive_ake(
        &self,
        ctx: &mut SessionContext,
        policy: Policy,
        message: &WireMessage,
        outbox: &mut Outbox,
    ) -> Inbound {
        let Some(identity) = self.user_state.key_for(&ctx.id.account, &ctx.id.protocol) else {
            outbox.push(Effect::Advisory(Advisory::MissingKeyPair));
            return Inbound::Ignored;
        };

        let ake_ctx = self.ake_context(policy, identity.as_ref());
        match ctx.ake.handle(message, &ake_ctx) {
            Ok(outcome) => {
                if let Some(reply) = outcome.reply {
                    outbox.inject(reply.to_wire());
                }
                if let Some(established) = outcome.established {
                    go_encrypted(ctx, established, outbox);
                }
                Inbound::Ignored
            }
            Err(ProtocolError::AuthenticationFailure { what }) => {
                tracing::warn!(
                    "Key exchange message from {} failed authentication ({})",
                    ctx.id,
                    what
                );
                unreadable(UnreadableReason::AuthenticationFailure, outbox)
            }
            Err(e) => {
                tracing::debug!(
                    "Dropping {} from {}: {}",
                    message.message.message_type().name(),
                    ctx.id,
                    e
                );
                Inbound::Ignored
            }
        }
    }

    fn receive_data(
        &self,
        ctx: &mut SessionContext,
        version: u16,
        data: &DataMessage,
        outbox: &mut Outbox,
    ) -> Inbound {
        if !ctx.epochs.has_keys() {
            tracing::info!("Encrypted message from {} outside a private conversation", ctx.id);
            outbox.inject(envelope::error_message(&format!(
                "You sent encrypted data to {}, who wasn't expecting it.",
                ctx.id.account
            )));
            return unreadable(UnreadableReason::NotPrivate, outbox);
        }

        let payload = match ctx
            .epochs
            .find_receiving(&data.sender_ephemeral)
            .and_then(|epoch| epoch.channel.open(version, data))
        {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!("Dropping data message from {}: {}", ctx.id, e);
                return unreadable(reason_for(&e), outbox);
            }
        };

        let (body, records) = match tlv::decode_payload(&payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!("Bad payload from {}: {}", ctx.id, e);
                return unreadable(UnreadableReason::Malformed, outbox);
            }
        };

        if records.iter().any(ExtensionRecord::is_disconnected) {
            tracing::info!("{} ended the private conversation", ctx.id);
            let kind = TransitionKind::Finished { by_peer: true };
            transition(ctx, MessageState::Finished, kind, outbox);
            ctx.clear_keys();
        }

        let meaningful = records
            .iter()
            .any(|r| !r.is_padding() && !r.is_disconnected());
        if body.is_empty() && !meaningful {
            return Inbound::Ignored;
        }

        Inbound::Message {
            text: body,
            records,
            encrypted: true,
        }
    }

    /// Drop to PLAINTEXT without negotiation, discarding all keys
    ///
    /// Unknown sessions are left alone.
    pub fn force_plaintext(&self, id: &SessionId) {
        let found = self.with_existing_session(id, |ctx, outbox| {
            ctx.clear_keys();
            if ctx.msg_state != MessageState::Plaintext {
                transition(ctx, MessageState::Plaintext, TransitionKind::GoneInsecure, outbox);
            }
        });
        if found.is_none() {
            tracing::debug!("No session {} to reset", id);
        }
    }

    /// End the private conversation
    ///
    /// While encrypted, tells the peer (publishing our receiving MAC keys)
    /// and moves to FINISHED. From FINISHED, returns to PLAINTEXT.
    pub fn end_session(&self, id: &SessionId) -> Result<()> {
        self.with_session(id, |ctx, outbox| match ctx.msg_state {
            MessageState::Encrypted => {
                ctx.epochs.reveal_all();
                let message = seal(ctx, "", &[ExtensionRecord::disconnected()])?;
                outbox.inject(message.to_wire());
                let kind = TransitionKind::Finished { by_peer: false };
                transition(ctx, MessageState::Finished, kind, outbox);
                ctx.clear_keys();
                Ok(())
            }
            MessageState::Finished => {
                transition(ctx, MessageState::Plaintext, TransitionKind::GoneInsecure, outbox);
                Ok(())
            }
            MessageState::Plaintext => {
                ctx.ake.reset();
                Ok(())
            }
        })
    }

    /// Ask the peer to start a private conversation
    pub fn start_session(&self, id: &SessionId) -> Result<()> {
        let policy = self.policy.policy(&id.account);
        let query = envelope::query_message(policy.versions(), &id.account).ok_or_else(|| {
            OtrError::from(ProtocolError::PolicyRefusal {
                reason: "no protocol version allowed".to_string(),
            })
        })?;
        if self.user_state.key_for(&id.account, &id.protocol).is_none() {
            return Err(ProtocolError::NoKeyPair {
                account: id.account.clone(),
                protocol: id.protocol.clone(),
            }
            .into());
        }
        self.with_session(id, |_, outbox| outbox.inject(query));
        Ok(())
    }

    /// Current observable state of a session, if it exists
    pub fn session(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.user_state.find(id, false)
    }

    pub fn forget(&self, id: &SessionId) -> bool {
        self.user_state.forget(id)
    }

    pub fn forget_all(&self) {
        self.user_state.forget_all()
    }
}

/// Seal user text and records under the current epoch
fn seal(ctx: &mut SessionContext, text: &str, records: &[ExtensionRecord]) -> Result<WireMessage> {
    let payload = tlv::encode_payload(text, records)?;
    let (version, data) = ctx.epochs.seal(&payload)?;
    Ok(WireMessage::new(version.as_u16(), Message::Data(data)))
}

fn sending_exhausted(ctx: &SessionContext) -> bool {
    !ctx.ake.in_progress()
        && ctx
            .epochs
            .current()
            .is_some_and(|epoch| epoch.channel.needs_rekey_by_counter())
}

fn go_encrypted(ctx: &mut SessionContext, established: Established, outbox: &mut Outbox) {
    let Established {
        version,
        ours,
        their_public,
        peer_long_term,
        ssid,
        keys,
    } = established;

    ctx.epochs
        .establish(KeyEpoch::new(version, ours.public, their_public, keys));
    ctx.version = Some(version);
    ctx.peer_long_term = Some(peer_long_term);
    ctx.ssid = Some(ssid);
    ctx.tag_offer = TagOffer::Accepted;

    let kind = if ctx.msg_state == MessageState::Encrypted {
        TransitionKind::Refreshed { version }
    } else {
        TransitionKind::GoneSecure { version }
    };
    transition(ctx, MessageState::Encrypted, kind, outbox);
}

/// Change the message state and queue the single notification for it
fn transition(
    ctx: &mut SessionContext,
    new: MessageState,
    kind: TransitionKind,
    outbox: &mut Outbox,
) {
    let change = StateChange {
        session: ctx.id.clone(),
        old: ctx.msg_state,
        new,
        kind,
    };
    tracing::info!("{}", change);
    ctx.msg_state = new;
    outbox.push(Effect::StateChanged(change));
}

fn received_plaintext(
    ctx: &SessionContext,
    policy: Policy,
    text: String,
    outbox: &mut Outbox,
) -> Inbound {
    if ctx.msg_state != MessageState::Plaintext || policy.requires_encryption() {
        tracing::debug!("Unencrypted message from {} in {}", ctx.id, ctx.msg_state);
        outbox.push(Effect::Advisory(Advisory::ReceivedUnencrypted));
    }
    Inbound::Message {
        text,
        records: Vec::new(),
        encrypted: false,
    }
}

fn unreadable(reason: UnreadableReason, outbox: &mut Outbox) -> Inbound {
    outbox.push(Effect::Unreadable(reason.clone()));
    Inbound::Unreadable(reason)
}

fn reason_for(err: &ProtocolError) -> UnreadableReason {
    match err {
        ProtocolError::AuthenticationFailure { .. } => UnreadableReason::AuthenticationFailure,
        ProtocolError::StaleKeyEpoch => UnreadableReason::StaleKeyEpoch,
        ProtocolError::ReplayDetected { .. } => UnreadableReason::Replay,
        _ => UnreadableReason::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use std::time::Duration;

    use crate::callbacks::NoopCallbacks;
    use crate::context::EngineConfig;
    use crate::policy::PolicyTable;
    use crate::protocol::transport::REJECT_AFTER_MESSAGES;
    use crate::protocol::AkePhase;

    /// Callbacks that only collect injected messages
    #[derive(Default)]
    struct Queue(Mutex<VecDeque<(SessionId, String)>>);

    impl AppCallbacks for Queue {
        fn inject_message(&self, session: &SessionId, message: &str) {
            self.0
                .lock()
                .unwrap()
                .push_back((session.clone(), message.to_string()));
        }

        fn state_changed(&self, _change: &StateChange) {}

        fn unreadable_message(&self, _session: &SessionId, _reason: &UnreadableReason) {}

        fn display_advisory(&self, _session: &SessionId, _advisory: &Advisory) {}
    }

    fn alice() -> SessionId {
        SessionId::new("alice", "bob", "xmpp")
    }

    fn bob() -> SessionId {
        SessionId::new("bob", "alice", "xmpp")
    }

    fn deliver_all(engine: &Engine<'_>, queue: &Queue) {
        loop {
            let next = queue.0.lock().unwrap().pop_front();
            let Some((from, message)) = next else { break };
            let to = SessionId::new(from.peer, from.account, from.protocol);
            engine.receive(&to, &message);
        }
    }

    fn established<'a>(us: &'a UserState, policy: &'a PolicyTable, queue: &'a Queue) -> Engine<'a> {
        us.generate_key("alice", "xmpp");
        us.generate_key("bob", "xmpp");
        let engine = Engine::new(us, policy, queue);
        engine.start_session(&alice()).unwrap();
        deliver_all(&engine, queue);
        engine
    }

    #[test]
    fn test_exhausted_counter_triggers_refresh() {
        let us = UserState::new();
        let policy = PolicyTable::new(Policy::DEFAULT);
        let queue = Queue::default();
        let engine = established(&us, &policy, &queue);

        {
            let context = us.entry(&alice());
            let mut ctx = lock(&context);
            let epoch = ctx.epochs.current_mut().unwrap();
            epoch.channel.sending_counter = REJECT_AFTER_MESSAGES - 10;
        }

        let wire = engine.send(&alice(), "nearly out").unwrap();
        assert!(wire.starts_with(envelope::ENVELOPE_PREFIX));

        let snapshot = engine.session(&alice()).unwrap();
        assert_eq!(snapshot.msg_state, MessageState::Encrypted);
        assert!(snapshot.ake_phase != AkePhase::Done);
        assert_eq!(queue.0.lock().unwrap().len(), 1);

        let before = snapshot.ssid;
        deliver_all(&engine, &queue);
        let after = engine.session(&alice()).unwrap();
        assert_eq!(after.msg_state, MessageState::Encrypted);
        assert_ne!(after.ssid, before);
    }

    #[test]
    fn test_callbacks_run_without_session_lock() {
        struct Reentrant<'a> {
            us: &'a UserState,
        }

        impl AppCallbacks for Reentrant<'_> {
            fn inject_message(&self, session: &SessionId, _message: &str) {
                // Would deadlock if the session were still locked
                let context = self.us.entry(session);
                let _guard = lock(&context);
            }

            fn state_changed(&self, _change: &StateChange) {}

            fn unreadable_message(&self, _session: &SessionId, _reason: &UnreadableReason) {}

            fn display_advisory(&self, _session: &SessionId, _advisory: &Advisory) {}
        }

        let us = UserState::new();
        us.generate_key("bob", "xmpp");
        let policy = PolicyTable::new(Policy::DEFAULT);
        let app = Reentrant { us: &us };
        let engine = Engine::new(&us, &policy, &app);
        engine.start_session(&bob()).unwrap();
    }

    #[test]
    fn test_start_session_needs_key() {
        let us = UserState::new();
        let policy = PolicyTable::new(Policy::DEFAULT);
        let engine = Engine::new(&us, &policy, &NoopCallbacks);

        let err = engine.start_session(&alice()).unwrap_err();
        assert!(matches!(err, OtrError::Protocol(ProtocolError::NoKeyPair { .. })));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_query_is_rewritten_for_policy() {
        let us = UserState::new();
        let policy = |_: &str| Policy::ALLOW_V2;
        let engine = Engine::new(&us, &policy, &NoopCallbacks);

        let wire = engine.send(&alice(), "?OTR?").unwrap();
        assert!(wire.starts_with("?OTRv2?"));
    }

    #[test]
    fn test_stalled_exchange_is_discarded() {
        let config = EngineConfig {
            handshake_timeout: Duration::ZERO,
            ..EngineConfig::default()
        };
        let us = UserState::with_config(config);
        us.generate_key("alice", "xmpp");
        us.generate_key("bob", "xmpp");
        let policy = PolicyTable::new(Policy::DEFAULT);
        let queue = Queue::default();
        let engine = Engine::new(&us, &policy, &queue);

        let pop = || queue.0.lock().unwrap().pop_front().unwrap().1;

        engine.start_session(&alice()).unwrap();
        engine.receive(&bob(), &pop());
        assert_eq!(
            engine.session(&bob()).unwrap().ake_phase,
            AkePhase::AwaitingDhKey
        );

        let commit = pop();
        engine.receive(&alice(), &commit);
        let dh_key = pop();

        // Bob's exchange has outlived the timeout by the time the key arrives
        assert_eq!(engine.receive(&bob(), &dh_key), Inbound::Ignored);
        let snapshot = engine.session(&bob()).unwrap();
        assert_eq!(snapshot.ake_phase, AkePhase::None);
        assert_eq!(snapshot.msg_state, MessageState::Plaintext);
        assert!(queue.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_force_plaintext_ignores_unknown_session() {
        let us = UserState::new();
        let policy = PolicyTable::new(Policy::DEFAULT);
        let engine = Engine::new(&us, &policy, &NoopCallbacks);

        engine.force_plaintext(&alice());
        assert!(engine.session(&alice()).is_none());
        assert!(us.sessions().is_empty());
    }
}
