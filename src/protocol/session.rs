//! Key epochs for an established private conversation
//!
//! Every completed key exchange produces a new epoch. The previous epoch is
//! kept for receiving only, for a grace window, so messages already in flight
//! during a refresh still decrypt. When an epoch's receiving keys are dropped
//! its MAC key is queued for publication in the next outgoing data message.

use std::fmt;
use std::time::{Duration, Instant};

use crate::crypto::keys::DataKeys;
use crate::error::ProtocolError;
use crate::policy::ProtocolVersion;
use crate::protocol::messages::DataMessage;
use crate::protocol::transport::DataChannel;

/// How long the previous epoch keeps accepting messages after a refresh
pub const PREVIOUS_KEY_GRACE: Duration = Duration::from_secs(60);

/// Keys from one completed key exchange
pub struct KeyEpoch {
    pub version: ProtocolVersion,
    /// Our ephemeral public value; sent with every data message
    pub our_public: [u8; 32],
    /// The peer's ephemeral public value; identifies its data messages
    pub their_public: [u8; 32],
    pub channel: DataChannel,
    pub established_at: Instant,
}

impl KeyEpoch {
    pub fn new(
        version: ProtocolVersion,
        our_public: [u8; 32],
        their_public: [u8; 32],
        keys: DataKeys,
    ) -> Self {
        let DataKeys { sending, receiving } = keys;
        Self {
            version,
            our_public,
            their_public,
            channel: DataChannel::new(sending, receiving),
            established_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }
}

struct RetiredEpoch {
    epoch: KeyEpoch,
    retired_at: Instant,
}

/// Current and previous key epochs of one session
pub struct EpochManager {
    current: Option<KeyEpoch>,
    previous: Option<RetiredEpoch>,
    grace: Duration,
    /// Receiving MAC keys waiting to be published
    pending_reveal: Vec<[u8; 32]>,
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new(PREVIOUS_KEY_GRACE)
    }
}

impl fmt::Debug for EpochManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochManager")
            .field("current", &self.current.as_ref().map(|e| e.version))
            .field("has_previous", &self.previous.is_some())
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl EpochManager {
    pub fn new(grace: Duration) -> Self {
        Self {
            current: None,
            previous: None,
            grace,
            pending_reveal: Vec::new(),
        }
    }

    pub fn has_keys(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&KeyEpoch> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut KeyEpoch> {
        self.current.as_mut()
    }

    /// Install a freshly negotiated epoch, retiring the current one
    pub fn establish(&mut self, epoch: KeyEpoch) {
        if let Some(old) = self.previous.take() {
            self.queue_reveal(&old.epoch);
        }

        if let Some(current) = self.current.take() {
            tracing::debug!("Retiring key epoch after {:?}", current.age());
            self.previous = Some(RetiredEpoch {
                epoch: current,
                retired_at: Instant::now(),
            });
        }

        tracing::debug!(
            "Key epoch established (peer ephemeral {})",
            hex::encode(&epoch.their_public[..8])
        );
        self.current = Some(epoch);
    }

    /// Drop the previous epoch once its grace window has passed
    pub fn expire_previous(&mut self) {
        let expired = self
            .previous
            .as_ref()
            .is_some_and(|retired| retired.retired_at.elapsed() >= self.grace);

        if expired {
            if let Some(old) = self.previous.take() {
                tracing::debug!("Previous key epoch expired");
                self.queue_reveal(&old.epoch);
            }
        }
    }

    /// Find the epoch a data message from `sender_ephemeral` was sealed under
    pub fn find_receiving(
        &mut self,
        sender_ephemeral: &[u8; 32],
    ) -> Result<&mut KeyEpoch, ProtocolError> {
        self.expire_previous();

        if let Some(current) = self.current.as_mut() {
            if current.their_public == *sender_ephemeral {
                return Ok(current);
            }
        }

        if let Some(retired) = self.previous.as_mut() {
            if retired.epoch.their_public == *sender_ephemeral {
                return Ok(&mut retired.epoch);
            }
        }

        Err(ProtocolError::StaleKeyEpoch)
    }

    /// Queue every receiving MAC key for publication
    ///
    /// Used right before the last data message of a conversation.
    pub fn reveal_all(&mut self) {
        if let Some(old) = self.previous.take() {
            self.queue_reveal(&old.epoch);
        }
        if let Some(current) = self.current.as_ref() {
            let mac = current.channel.receiving.mac;
            self.pending_reveal.push(mac);
        }
    }

    /// Seal a payload under the current epoch, publishing queued MAC keys
    ///
    /// The queue is only emptied once the message is sealed.
    pub fn seal(&mut self, payload: &[u8]) -> Result<(ProtocolVersion, DataMessage), ProtocolError> {
        let epoch = self.current.as_mut().ok_or(ProtocolError::StaleKeyEpoch)?;
        let version = epoch.version;
        let data = epoch.channel.seal(
            version.as_u16(),
            epoch.our_public,
            payload,
            self.pending_reveal.concat(),
        )?;
        self.pending_reveal.clear();
        Ok((version, data))
    }

    /// Forget all key material
    pub fn clear(&mut self) {
        self.current = None;
        self.previous = None;
        self.pending_reveal.clear();
    }

    fn queue_reveal(&mut self, epoch: &KeyEpoch) {
        self.pending_reveal.push(epoch.channel.receiving.mac);
    }
}
