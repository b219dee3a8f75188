//! Authenticated key exchange
//!
//! Version 2 runs four messages with a hash-then-reveal commitment:
//!
//! ```text
//! initiator                         responder
//!   DH-Commit  { ChaCha20_r(gx), H(gx) }  ->
//!                                     <-  DH-Key { gy }
//!   Reveal-Sig { r, AEAD_c(pubI, Sign(MAC_m1(gx, gy, pubI, v))) }  ->
//!                                     <-  Signature { AEAD_c'(pubR, Sign(MAC_m1'(gy, gx, pubR, v))) }
//! ```
//!
//! The long-term key signs a MAC of the transcript and never message content.
//! Version 1 is a single signed `KeyExchange` answered with a reply flag.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::crypto::keys::{self, AkeKeys, DataKeys, SSID_LEN};
use crate::crypto::signing::{self, LongTermKey, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::crypto::{aead, blake2s, cipher, DhGroup, EphemeralKeyPair};
use crate::error::ProtocolError;
use crate::policy::{ProtocolVersion, VersionSet};
use crate::protocol::messages::{
    header, DhCommit, DhKey, KeyExchange, Message, MessageType, RevealSignature,
    SignatureMessage, WireMessage,
};

const V2: u16 = ProtocolVersion::V2 as u16;
const V1: u16 = ProtocolVersion::V1 as u16;

/// Domain label for version 1 key-exchange signatures
const V1_SIGNATURE_LABEL: &[u8] = b"offrecord v1 key exchange";

/// Decrypted signature block: long-term public key followed by its signature
const SIGNATURE_BLOCK_LEN: usize = PUBLIC_KEY_LEN + SIGNATURE_LEN;

/// Observable AKE phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AkePhase {
    None,
    AwaitingDhKey,
    AwaitingRevealSig,
    AwaitingSig,
    V1Setup,
    Done,
}

impl fmt::Display for AkePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl AkePhase {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::AwaitingDhKey => "AWAITING_DHKEY",
            Self::AwaitingRevealSig => "AWAITING_REVEALSIG",
            Self::AwaitingSig => "AWAITING_SIG",
            Self::V1Setup => "V1_SETUP",
            Self::Done => "DONE",
        }
    }
}

/// AKE state with the in-flight material each phase needs
enum AkeState {
    None,
    AwaitingDhKey {
        r: Zeroizing<[u8; 32]>,
        ours: EphemeralKeyPair,
        commit: DhCommit,
    },
    AwaitingRevealSig {
        ours: EphemeralKeyPair,
        their_commit: DhCommit,
    },
    AwaitingSig {
        ours: EphemeralKeyPair,
        their_public: [u8; 32],
        shared: Zeroizing<[u8; 32]>,
        keys: AkeKeys,
        reveal: RevealSignature,
    },
    V1Setup {
        ours: EphemeralKeyPair,
    },
    Done,
}

impl AkeState {
    fn phase(&self) -> AkePhase {
        match self {
            Self::None => AkePhase::None,
            Self::AwaitingDhKey { .. } => AkePhase::AwaitingDhKey,
            Self::AwaitingRevealSig { .. } => AkePhase::AwaitingRevealSig,
            Self::AwaitingSig { .. } => AkePhase::AwaitingSig,
            Self::V1Setup { .. } => AkePhase::V1Setup,
            Self::Done => AkePhase::Done,
        }
    }
}

/// What the AKE needs from its surroundings to process a message
pub struct AkeContext<'a> {
    pub group: &'a dyn DhGroup,
    pub identity: &'a dyn LongTermKey,
    /// Versions the local policy allows
    pub allowed: VersionSet,
}

/// Key material from a completed exchange
pub struct Established {
    pub version: ProtocolVersion,
    pub ours: EphemeralKeyPair,
    pub their_public: [u8; 32],
    pub peer_long_term: [u8; PUBLIC_KEY_LEN],
    pub ssid: [u8; SSID_LEN],
    pub keys: DataKeys,
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("version", &self.version)
            .field("ssid", &hex::encode(self.ssid))
            .field("peer", &signing::fingerprint(&self.peer_long_term))
            .finish_non_exhaustive()
    }
}

/// Result of feeding one message to the AKE
#[derive(Default)]
pub struct AkeOutcome {
    /// Message to send back to the peer
    pub reply: Option<WireMessage>,
    /// Set when this message completed the exchange
    pub established: Option<Established>,
}

impl AkeOutcome {
    fn reply(message: WireMessage) -> Self {
        Self {
            reply: Some(message),
            established: None,
        }
    }
}

/// Per-session key-exchange driver
pub struct Ake {
    state: AkeState,
    started: Option<Instant>,
    /// Every v1 peer ephemeral this session has completed an exchange with
    v1_accepted: HashSet<[u8; 32]>,
}

impl Default for Ake {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Ake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ake")
            .field("phase", &self.phase())
            .field("started", &self.started)
            .finish()
    }
}

impl Ake {
    pub fn new() -> Self {
        Self {
            state: AkeState::None,
            started: None,
            v1_accepted: HashSet::new(),
        }
    }

    pub fn phase(&self) -> AkePhase {
        self.state.phase()
    }

    /// An exchange is running and has not completed
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, AkeState::None | AkeState::Done)
    }

    /// Has the running exchange been stalled longer than `timeout`?
    pub fn timed_out(&self, timeout: Duration) -> bool {
        match self.started {
            Some(started) if self.in_progress() => started.elapsed() >= timeout,
            _ => false,
        }
    }

    /// Discard all in-flight handshake material
    pub fn reset(&mut self) {
        self.state = AkeState::None;
        self.started = None;
    }

    fn enter(&mut self, state: AkeState) {
        tracing::debug!("AKE {} -> {}", self.state.phase(), state.phase());
        if matches!(state, AkeState::Done) {
            self.started = None;
        } else if !self.in_progress() {
            self.started = Some(Instant::now());
        }
        self.state = state;
    }

    /// Start a new exchange, discarding any in-flight one
    pub fn start(
        &mut self,
        version: ProtocolVersion,
        ctx: &AkeContext<'_>,
    ) -> WireMessage {
        self.reset();
        match version {
            ProtocolVersion::V2 => {
                let mut r = Zeroizing::new([0u8; 32]);
                OsRng.fill_bytes(&mut r[..]);
                let ours = ctx.group.generate_keypair();
                let commit = DhCommit {
                    encrypted_gx: cipher::apply_keystream(&r, 0, &ours.public),
                    hashed_gx: blake2s::hash(&ours.public),
                };
                let message = WireMessage::new(V2, Message::DhCommit(commit.clone()));
                self.enter(AkeState::AwaitingDhKey { r, ours, commit });
                message
            }
            ProtocolVersion::V1 => {
                let ours = ctx.group.generate_keypair();
                let message = v1_key_exchange(ctx.identity, &ours, None);
                self.enter(AkeState::V1Setup { ours });
                message
            }
        }
    }

    /// Advance the exchange with a message from the peer
    ///
    /// Stale and duplicate messages come back as `HandshakeOutOfOrder`;
    /// failed signatures, MACs, and commitments as `AuthenticationFailure`
    /// with the state left unchanged.
    pub fn handle(
        &mut self,
        message: &WireMessage,
        ctx: &AkeContext<'_>,
    ) -> Result<AkeOutcome, ProtocolError> {
        let msg_type = message.message.message_type();
        let expected = if msg_type == MessageType::KeyExchange { V1 } else { V2 };
        if message.version != expected {
            return Err(ProtocolError::UnsupportedVersion {
                version: message.version,
            });
        }
        let version = ProtocolVersion::try_from(expected)
            .map_err(|version| ProtocolError::UnsupportedVersion { version })?;
        if !ctx.allowed.contains(version) {
            return Err(ProtocolError::PolicyRefusal {
                reason: format!("{} key exchange not allowed", version),
            });
        }

        match &message.message {
            Message::DhCommit(commit) => Ok(self.on_dh_commit(commit, ctx)),
            Message::DhKey(key) => self.on_dh_key(key, ctx),
            Message::RevealSignature(reveal) => self.on_reveal_signature(reveal, ctx),
            Message::Signature(sig) => self.on_signature(sig),
            Message::KeyExchange(kx) => self.on_key_exchange(kx, ctx),
            Message::Data(_) => Err(self.out_of_order(msg_type)),
        }
    }

    fn out_of_order(&self, msg_type: MessageType) -> ProtocolError {
        ProtocolError::HandshakeOutOfOrder {
            message: msg_type.name(),
            state: self.phase().name(),
        }
    }

    /// A message that belongs to a later phase: start over from NONE
    fn restart(&mut self, msg_type: MessageType) -> ProtocolError {
        let err = self.out_of_order(msg_type);
        tracing::debug!("{}; discarding in-flight exchange", err);
        self.reset();
        err
    }

    fn on_dh_commit(&mut self, their_commit: &DhCommit, ctx: &AkeContext<'_>) -> AkeOutcome {
        match &mut self.state {
            AkeState::AwaitingDhKey { commit, .. }
                if commit.hashed_gx > their_commit.hashed_gx =>
            {
                tracing::debug!("Simultaneous commit; ours wins, retransmitting");
                AkeOutcome::reply(WireMessage::new(V2, Message::DhCommit(commit.clone())))
            }
            AkeState::AwaitingRevealSig { ours, their_commit: stored } => {
                *stored = their_commit.clone();
                AkeOutcome::reply(dh_key_message(ours))
            }
            _ => {
                let ours = ctx.group.generate_keypair();
                let reply = dh_key_message(&ours);
                self.enter(AkeState::AwaitingRevealSig {
                    ours,
                    their_commit: their_commit.clone(),
                });
                AkeOutcome::reply(reply)
            }
        }
    }

    fn on_dh_key(
        &mut self,
        key: &DhKey,
        ctx: &AkeContext<'_>,
    ) -> Result<AkeOutcome, ProtocolError> {
        match &self.state {
            AkeState::AwaitingDhKey { r, ours, .. } => {
                let shared = ctx.group.agree(&ours.secret, &key.gy)?;
                let keys = AkeKeys::derive(&shared);
                let signature_block = seal_signature_block(
                    &keys.c,
                    &keys.m1,
                    &ours.public,
                    &key.gy,
                    ctx.identity,
                    MessageType::RevealSignature,
                )?;
                let reveal = RevealSignature {
                    revealed_key: **r,
                    signature_block,
                };
                let ours = ours.clone();
                let reply = WireMessage::new(V2, Message::RevealSignature(reveal.clone()));
                self.enter(AkeState::AwaitingSig {
                    ours,
                    their_public: key.gy,
                    shared,
                    keys,
                    reveal,
                });
                Ok(AkeOutcome::reply(reply))
            }
            AkeState::AwaitingSig {
                their_public,
                reveal,
                ..
            } if *their_public == key.gy => Ok(AkeOutcome::reply(WireMessage::new(
                V2,
                Message::RevealSignature(reveal.clone()),
            ))),
            _ => Err(self.out_of_order(MessageType::DhKey)),
        }
    }

    fn on_reveal_signature(
        &mut self,
        reveal: &RevealSignature,
        ctx: &AkeContext<'_>,
    ) -> Result<AkeOutcome, ProtocolError> {
        match &self.state {
            AkeState::AwaitingRevealSig { ours, their_commit } => {
                let r: [u8; 32] = reveal.revealed_key;
                let gx = cipher::apply_keystream(&r, 0, &their_commit.encrypted_gx);
                let gx: [u8; 32] = gx.as_slice().try_into().map_err(|_| {
                    ProtocolError::AuthenticationFailure { what: "commitment" }
                })?;
                if !blake2s::tags_equal(&their_commit.hashed_gx, &blake2s::hash(&gx)) {
                    return Err(ProtocolError::AuthenticationFailure { what: "commitment" });
                }

                let shared = ctx.group.agree(&ours.secret, &gx)?;
                let keys = AkeKeys::derive(&shared);
                let peer_long_term = open_signature_block(
                    &keys.c,
                    &keys.m1,
                    &gx,
                    &ours.public,
                    &reveal.signature_block,
                    MessageType::RevealSignature,
                )?;

                let signature_block = seal_signature_block(
                    &keys.c_prime,
                    &keys.m1_prime,
                    &ours.public,
                    &gx,
                    ctx.identity,
                    MessageType::Signature,
                )?;
                let reply = WireMessage::new(
                    V2,
                    Message::Signature(SignatureMessage { signature_block }),
                );

                let established = Established {
                    version: ProtocolVersion::V2,
                    keys: DataKeys::derive(&shared, &ours.public, &gx),
                    ours: ours.clone(),
                    their_public: gx,
                    peer_long_term,
                    ssid: keys.ssid,
                };
                self.enter(AkeState::Done);
                Ok(AkeOutcome {
                    reply: Some(reply),
                    established: Some(established),
                })
            }
            AkeState::AwaitingDhKey { .. } => Err(self.restart(MessageType::RevealSignature)),
            _ => Err(self.out_of_order(MessageType::RevealSignature)),
        }
    }

    fn on_signature(&mut self, sig: &SignatureMessage) -> Result<AkeOutcome, ProtocolError> {
        match &self.state {
            AkeState::AwaitingSig {
                ours,
                their_public,
                shared,
                keys,
                ..
            } => {
                let peer_long_term = open_signature_block(
                    &keys.c_prime,
                    &keys.m1_prime,
                    their_public,
                    &ours.public,
                    &sig.signature_block,
                    MessageType::Signature,
                )?;

                let established = Established {
                    version: ProtocolVersion::V2,
                    keys: DataKeys::derive(shared, &ours.public, their_public),
                    ours: ours.clone(),
                    their_public: *their_public,
                    peer_long_term,
                    ssid: keys.ssid,
                };
                self.enter(AkeState::Done);
                Ok(AkeOutcome {
                    reply: None,
                    established: Some(established),
                })
            }
            AkeState::AwaitingDhKey { .. } | AkeState::AwaitingRevealSig { .. } => {
                Err(self.restart(MessageType::Signature))
            }
            _ => Err(self.out_of_order(MessageType::Signature)),
        }
    }

    fn on_key_exchange(
        &mut self,
        kx: &KeyExchange,
        ctx: &AkeContext<'_>,
    ) -> Result<AkeOutcome, ProtocolError> {
        let setup = match &self.state {
            AkeState::V1Setup { ours } => Some(ours),
            _ => None,
        };
        // Replies are signed over the ephemeral they answer
        let addressed_to = match (setup, kx.reply) {
            (Some(ours), true) => ours.public,
            (None, true) => return Err(self.out_of_order(MessageType::KeyExchange)),
            (_, false) => [0u8; 32],
        };
        signing::verify(
            &kx.long_term_public,
            &v1_signed_bytes(&kx.long_term_public, &kx.dh_public, &addressed_to, kx.reply),
            &kx.signature,
        )?;

        if self.v1_accepted.contains(&kx.dh_public) {
            tracing::debug!("Key exchange repeats an accepted ephemeral; dropping");
            return Err(self.out_of_order(MessageType::KeyExchange));
        }

        let ours = match setup {
            Some(ours) => ours.clone(),
            None => ctx.group.generate_keypair(),
        };

        let shared = ctx.group.agree(&ours.secret, &kx.dh_public)?;
        let reply = (!kx.reply).then(|| v1_key_exchange(ctx.identity, &ours, Some(&kx.dh_public)));
        let established = Established {
            version: ProtocolVersion::V1,
            keys: DataKeys::derive(&shared, &ours.public, &kx.dh_public),
            ssid: AkeKeys::derive(&shared).ssid,
            ours,
            their_public: kx.dh_public,
            peer_long_term: kx.long_term_public,
        };
        self.v1_accepted.insert(kx.dh_public);
        self.enter(AkeState::Done);
        Ok(AkeOutcome {
            reply,
            established: Some(established),
        })
    }
}

fn dh_key_message(ours: &EphemeralKeyPair) -> WireMessage {
    WireMessage::new(V2, Message::DhKey(DhKey { gy: ours.public }))
}

/// `label | version | reply | pub | gx | peer gx`, with a zero peer value
/// when the sender has not seen the peer's ephemeral yet
fn v1_signed_bytes(
    long_term: &[u8; PUBLIC_KEY_LEN],
    dh_public: &[u8; 32],
    peer_dh_public: &[u8; 32],
    reply: bool,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(V1_SIGNATURE_LABEL.len() + 3 + PUBLIC_KEY_LEN + 64);
    buf.extend_from_slice(V1_SIGNATURE_LABEL);
    buf.extend_from_slice(&V1.to_be_bytes());
    buf.push(u8::from(reply));
    buf.extend_from_slice(long_term);
    buf.extend_from_slice(dh_public);
    buf.extend_from_slice(peer_dh_public);
    buf
}

/// Build a KeyExchange; `answering` carries the peer ephemeral for a reply
fn v1_key_exchange(
    identity: &dyn LongTermKey,
    ours: &EphemeralKeyPair,
    answering: Option<&[u8; 32]>,
) -> WireMessage {
    let reply = answering.is_some();
    let peer = answering.copied().unwrap_or([0u8; 32]);
    let long_term_public = identity.public_key();
    let signature = identity.sign(&v1_signed_bytes(&long_term_public, &ours.public, &peer, reply));
    WireMessage::new(
        V1,
        Message::KeyExchange(KeyExchange {
            reply,
            long_term_public,
            dh_public: ours.public,
            signature,
        }),
    )
}

/// Encrypt our identity and transcript signature
fn seal_signature_block(
    enc_key: &[u8; 32],
    mac_key: &[u8; 32],
    own_ephemeral: &[u8; 32],
    peer_ephemeral: &[u8; 32],
    identity: &dyn LongTermKey,
    msg_type: MessageType,
) -> Result<Vec<u8>, ProtocolError> {
    let long_term = identity.public_key();
    let mac = keys::transcript_mac(mac_key, own_ephemeral, peer_ephemeral, &long_term, V2);
    let signature = identity.sign(&mac);

    let mut plain = Vec::with_capacity(SIGNATURE_BLOCK_LEN);
    plain.extend_from_slice(&long_term);
    plain.extend_from_slice(&signature);

    Ok(aead::encrypt(enc_key, 0, &plain, &header(V2, msg_type))?)
}

/// Decrypt and verify the peer's signature block, returning its long-term key
fn open_signature_block(
    enc_key: &[u8; 32],
    mac_key: &[u8; 32],
    signer_ephemeral: &[u8; 32],
    verifier_ephemeral: &[u8; 32],
    block: &[u8],
    msg_type: MessageType,
) -> Result<[u8; PUBLIC_KEY_LEN], ProtocolError> {
    let plain = aead::decrypt(enc_key, 0, block, &header(V2, msg_type))?;
    if plain.len() != SIGNATURE_BLOCK_LEN {
        return Err(ProtocolError::AuthenticationFailure {
            what: "signature block",
        });
    }

    let mut long_term = [0u8; PUBLIC_KEY_LEN];
    long_term.copy_from_slice(&plain[..PUBLIC_KEY_LEN]);
    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(&plain[PUBLIC_KEY_LEN..]);

    let mac = keys::transcript_mac(mac_key, signer_ephemeral, verifier_ephemeral, &long_term, V2);
    signing::verify(&long_term, &mac, &signature)?;
    Ok(long_term)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Ed25519KeyPair, X25519Group};

    fn both() -> VersionSet {
        VersionSet::NONE
            .with(ProtocolVersion::V1)
            .with(ProtocolVersion::V2)
    }

    fn ctx_for(identity: &Ed25519KeyPair, allowed: VersionSet) -> AkeContext<'_> {
        AkeContext {
            group: &X25519Group,
            identity,
            allowed,
        }
    }

    struct Party {
        identity: Ed25519KeyPair,
        ake: Ake,
    }

    impl Party {
        fn new() -> Self {
            Self {
                identity: Ed25519KeyPair::generate(),
                ake: Ake::new(),
            }
        }

        fn start(&mut self, version: ProtocolVersion) -> WireMessage {
            let ctx = ctx_for(&self.identity, both());
            self.ake.start(version, &ctx)
        }

        fn handle(&mut self, msg: &WireMessage) -> Result<AkeOutcome, ProtocolError> {
            let ctx = ctx_for(&self.identity, both());
            self.ake.handle(msg, &ctx)
        }
    }

    #[test]
    fn test_v2_exchange_completes() {
        let mut alice = Party::new();
        let mut bob = Party::new();

        let commit = alice.start(ProtocolVersion::V2);
        assert_eq!(alice.ake.phase(), AkePhase::AwaitingDhKey);

        let dh_key = bob.handle(&commit).unwrap().reply.unwrap();
        assert_eq!(bob.ake.phase(), AkePhase::AwaitingRevealSig);

        let reveal = alice.handle(&dh_key).unwrap().reply.unwrap();
        assert_eq!(alice.ake.phase(), AkePhase::AwaitingSig);

        let bob_out = bob.handle(&reveal).unwrap();
        let bob_done = bob_out.established.unwrap();
        assert_eq!(bob.ake.phase(), AkePhase::Done);

        let alice_out = alice.handle(&bob_out.reply.unwrap()).unwrap();
        assert!(alice_out.reply.is_none());
        let alice_done = alice_out.established.unwrap();

        assert_eq!(alice_done.ssid, bob_done.ssid);
        assert_eq!(alice_done.peer_long_term, bob.identity.public_key());
        assert_eq!(bob_done.peer_long_term, alice.identity.public_key());
        assert_eq!(
            alice_done.keys.sending.encryption,
            bob_done.keys.receiving.encryption
        );
        assert_eq!(alice_done.keys.receiving.mac, bob_done.keys.sending.mac);
    }

    #[test]
    fn test_simultaneous_commits_converge() {
        let mut alice = Party::new();
        let mut bob = Party::new();

        let commit_a = alice.start(ProtocolVersion::V2);
        let commit_b = bob.start(ProtocolVersion::V2);

        let reply_b = bob.handle(&commit_a).unwrap().reply.unwrap();
        let reply_a = alice.handle(&commit_b).unwrap().reply.unwrap();

        // Exactly one side keeps its commitment
        let phases = [alice.ake.phase(), bob.ake.phase()];
        assert!(phases.contains(&AkePhase::AwaitingDhKey));
        assert!(phases.contains(&AkePhase::AwaitingRevealSig));

        let mut queue = vec![(true, reply_b), (false, reply_a)];
        let mut completed = (0, 0);
        while let Some((to_alice, msg)) = queue.pop() {
            let party = if to_alice { &mut alice } else { &mut bob };
            if let Ok(outcome) = party.handle(&msg) {
                if outcome.established.is_some() {
                    if to_alice {
                        completed.0 += 1;
                    } else {
                        completed.1 += 1;
                    }
                }
                if let Some(reply) = outcome.reply {
                    queue.insert(0, (!to_alice, reply));
                }
            }
        }

        assert_eq!(completed, (1, 1));
        assert_eq!(alice.ake.phase(), AkePhase::Done);
        assert_eq!(bob.ake.phase(), AkePhase::Done);
    }

    #[test]
    fn test_stale_reveal_is_dropped() {
        let mut alice = Party::new();
        let mut bob = Party::new();

        let commit = alice.start(ProtocolVersion::V2);
        let dh_key = bob.handle(&commit).unwrap().reply.unwrap();
        let reveal = alice.handle(&dh_key).unwrap().reply.unwrap();
        bob.handle(&reveal).unwrap();

        let err = bob.handle(&reveal).err().unwrap();
        assert!(matches!(err, ProtocolError::HandshakeOutOfOrder { .. }));
        assert_eq!(bob.ake.phase(), AkePhase::Done);
    }

    #[test]
    fn test_future_message_restarts() {
        let mut alice = Party::new();
        let mut bob = Party::new();
        let mut carol = Party::new();

        let commit = alice.start(ProtocolVersion::V2);
        let dh_key = bob.handle(&commit).unwrap().reply.unwrap();
        let reveal = alice.handle(&dh_key).unwrap().reply.unwrap();

        carol.start(ProtocolVersion::V2);
        let err = carol.handle(&reveal).err().unwrap();
        assert!(matches!(err, ProtocolError::HandshakeOutOfOrder { .. }));
        assert_eq!(carol.ake.phase(), AkePhase::None);
    }

    #[test]
    fn test_tampered_reveal_fails_authentication() {
        let mut alice = Party::new();
        let mut bob = Party::new();

        let commit = alice.start(ProtocolVersion::V2);
        let dh_key = bob.handle(&commit).unwrap().reply.unwrap();
        let mut reveal = alice.handle(&dh_key).unwrap().reply.unwrap();
        if let Message::RevealSignature(r) = &mut reveal.message {
            r.signature_block[5] ^= 0x01;
        }

        let err = bob.handle(&reveal).err().unwrap();
        assert!(matches!(err, ProtocolError::AuthenticationFailure { .. }));
        assert_eq!(bob.ake.phase(), AkePhase::AwaitingRevealSig);
    }

    #[test]
    fn test_wrong_revealed_key_fails_commitment() {
        let mut alice = Party::new();
        let mut bob = Party::new();

        let commit = alice.start(ProtocolVersion::V2);
        let dh_key = bob.handle(&commit).unwrap().reply.unwrap();
        let mut reveal = alice.handle(&dh_key).unwrap().reply.unwrap();
        if let Message::RevealSignature(r) = &mut reveal.message {
            r.revealed_key[0] ^= 0xff;
        }

        assert_eq!(
            bob.handle(&reveal).err(),
            Some(ProtocolError::AuthenticationFailure { what: "commitment" })
        );
    }

    #[test]
    fn test_v1_exchange() {
        let mut alice = Party::new();
        let mut bob = Party::new();

        let kx = alice.start(ProtocolVersion::V1);
        assert_eq!(alice.ake.phase(), AkePhase::V1Setup);

        let bob_out = bob.handle(&kx).unwrap();
        let bob_done = bob_out.established.unwrap();
        let alice_out = alice.handle(&bob_out.reply.unwrap()).unwrap();
        let alice_done = alice_out.established.unwrap();

        assert!(alice_out.reply.is_none());
        assert_eq!(alice_done.version, ProtocolVersion::V1);
        assert_eq!(alice_done.ssid, bob_done.ssid);
        assert_eq!(
            alice_done.keys.sending.encryption,
            bob_done.keys.receiving.encryption
        );
    }

    #[test]
    fn test_v1_reply_without_setup_dropped() {
        let mut alice = Party::new();
        let mut bob = Party::new();

        let kx = alice.start(ProtocolVersion::V1);
        let reply = bob.handle(&kx).unwrap().reply.unwrap();

        let mut carol = Party::new();
        let err = carol.handle(&reply).err().unwrap();
        assert!(matches!(err, ProtocolError::HandshakeOutOfOrder { .. }));
    }

    #[test]
    fn test_v1_replayed_key_exchange_dropped() {
        let mut alice = Party::new();
        let mut bob = Party::new();

        let first = alice.start(ProtocolVersion::V1);
        let reply = bob.handle(&first).unwrap().reply.unwrap();
        alice.handle(&reply).unwrap();

        let second = alice.start(ProtocolVersion::V1);
        let reply = bob.handle(&second).unwrap().reply.unwrap();
        assert!(alice.handle(&reply).unwrap().established.is_some());

        let err = bob.handle(&first).err().unwrap();
        assert!(matches!(err, ProtocolError::HandshakeOutOfOrder { .. }));
        assert_eq!(bob.ake.phase(), AkePhase::Done);
    }

    #[test]
    fn test_v1_reply_bound_to_our_ephemeral() {
        let mut alice = Party::new();
        let mut bob = Party::new();

        let kx = alice.start(ProtocolVersion::V1);
        let reply = bob.handle(&kx).unwrap().reply.unwrap();

        // A new setup must not accept the answer to the old one
        alice.start(ProtocolVersion::V1);
        let err = alice.handle(&reply).err().unwrap();
        assert!(matches!(err, ProtocolError::AuthenticationFailure { .. }));
        assert_eq!(alice.ake.phase(), AkePhase::V1Setup);
    }

    #[test]
    fn test_policy_refuses_version() {
        let mut alice = Party::new();
        let bob = Party::new();
        let commit = alice.start(ProtocolVersion::V2);

        let mut ake = Ake::new();
        let ctx = ctx_for(&bob.identity, VersionSet::NONE.with(ProtocolVersion::V1));
        assert!(matches!(
            ake.handle(&commit, &ctx),
            Err(ProtocolError::PolicyRefusal { .. })
        ));
    }
}
