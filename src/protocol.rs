//! Handshake, master election, and transmit handling.
//!
//! [`Protocol`] owns all per-session protocol state (identity, peer registry,
//! master key, shared-key cache) and performs no I/O: incoming envelopes go in,
//! at most one reply envelope and one application event come out. The async
//! driver in [`crate::client`] does the sending.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::ConnectionStatus;
use crate::crypto::{decrypt, encrypt};
use crate::envelope::{Action, Envelope};
use crate::keys::{short_key, Identity};
use crate::registry::{PeerKeyRegistry, SharedKeyCache};
use crate::types::{ChannelBoxError, Result, KEY_SIZE};

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A peer's public key was recorded for the first time.
    PeerDiscovered {
        user_id: String,
        public_key: [u8; KEY_SIZE],
    },
    /// A `setMasterKey` announcement replaced the master key.
    MasterChanged {
        user_id: String,
        public_key: [u8; KEY_SIZE],
    },
    /// A `transmit` payload was decrypted.
    Payload { from_user_id: String, payload: Value },
    /// A `transmit` from a known peer failed to decrypt.
    DecryptionFailed { from_user_id: String, reason: String },
    /// A peer announced a clean shutdown. Its registry entry is kept.
    PeerLeft { user_id: String },
    /// The connection state machine changed state.
    Connection(ConnectionStatus),
}

/// Result of handling one incoming message.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reaction {
    /// Envelope to send back on the channel.
    pub reply: Option<Envelope>,
    /// Event to surface to the application.
    pub event: Option<SessionEvent>,
}

impl Reaction {
    fn none() -> Self {
        Self::default()
    }

    fn event(event: SessionEvent) -> Self {
        Self {
            reply: None,
            event: Some(event),
        }
    }
}

/// Counters for messages that were dropped without surfacing an error.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolStats {
    /// Text that was not a valid envelope, or an envelope with bad `data`.
    pub malformed: u64,
    /// Our own echoes and unicasts addressed to someone else.
    pub filtered: u64,
    /// Envelopes with an unrecognized action.
    pub unknown_actions: u64,
    /// `transmit` envelopes from peers with no registered key.
    pub unknown_senders: u64,
    /// `transmit` envelopes that failed authentication or decoding.
    pub undecryptable: u64,
}

/// Protocol state for one local identity.
pub struct Protocol {
    identity: Identity,
    peers: PeerKeyRegistry,
    shared_keys: SharedKeyCache,
    master_key: Option<[u8; KEY_SIZE]>,
    is_master: bool,
    stats: ProtocolStats,
}

impl Protocol {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            peers: PeerKeyRegistry::new(),
            shared_keys: SharedKeyCache::new(),
            master_key: None,
            is_master: false,
            stats: ProtocolStats::default(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> &str {
        self.identity.user_id()
    }

    pub fn peers(&self) -> &PeerKeyRegistry {
        &self.peers
    }

    pub fn master_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.master_key
    }

    /// Whether this peer has announced itself as master.
    pub fn is_master(&self) -> bool {
        self.is_master
    }

    /// Master announcement is offered only while no master is known and we
    /// have not announced ourselves.
    pub fn can_announce_master(&self) -> bool {
        self.master_key.is_none() && !self.is_master
    }

    pub fn stats(&self) -> ProtocolStats {
        self.stats
    }

    /// Discovery request broadcast after every successful connect.
    pub fn handshake_request(&self) -> Envelope {
        Envelope::handshake_request(&self.identity)
    }

    /// Claim the master role.
    ///
    /// Purely local bookkeeping plus a broadcast; any later announcement from
    /// another peer still overrides the master key on every receiver.
    pub fn announce_master(&mut self) -> Envelope {
        self.is_master = true;
        info!(user_id = %self.identity.user_id(), "announcing self as master");
        Envelope::set_master_key(&self.identity)
    }

    /// Departure notice for a clean shutdown.
    pub fn stop_notice(&self) -> Envelope {
        Envelope::stop(&self.identity)
    }

    /// Encrypt `payload` for `recipient`, or for the master when `None`.
    pub fn seal_transmit<T: Serialize + ?Sized>(
        &mut self,
        payload: &T,
        recipient: Option<[u8; KEY_SIZE]>,
    ) -> Result<Envelope> {
        let recipient = recipient.or(self.master_key).ok_or_else(|| {
            ChannelBoxError::StateError("no recipient key and no master key known".to_string())
        })?;
        let key = self.shared_keys.get_or_derive(&self.identity, &recipient);
        let ciphertext = encrypt(&key, payload)?;
        debug!(recipient = %short_key(&recipient), "sealed transmit payload");
        Ok(Envelope::transmit(&self.identity, ciphertext))
    }

    /// Handle raw text received from the channel.
    ///
    /// Malformed JSON is counted and dropped.
    pub fn handle_text(&mut self, text: &str) -> Reaction {
        match Envelope::parse(text) {
            Ok(envelope) => self.handle_envelope(&envelope),
            Err(e) => {
                self.stats.malformed += 1;
                debug!(error = %e, "dropping malformed message");
                Reaction::none()
            }
        }
    }

    /// Handle a parsed envelope.
    pub fn handle_envelope(&mut self, envelope: &Envelope) -> Reaction {
        if !envelope.is_addressed_to(self.identity.user_id()) {
            self.stats.filtered += 1;
            return Reaction::none();
        }

        let result = match &envelope.action {
            Action::HandshakeRequest => self.on_handshake_request(envelope),
            Action::HandshakeAnswer => self.on_handshake_answer(envelope),
            Action::SetMasterKey => self.on_set_master_key(envelope),
            Action::Transmit => self.on_transmit(envelope),
            Action::Stop => Ok(self.on_stop(envelope)),
            Action::Unknown(raw) => {
                self.stats.unknown_actions += 1;
                debug!(action = %raw, from = %envelope.from_user_id, "ignoring unknown action");
                Ok(Reaction::none())
            }
        };

        result.unwrap_or_else(|e| {
            self.stats.malformed += 1;
            debug!(
                error = %e,
                action = %envelope.action,
                from = %envelope.from_user_id,
                "dropping envelope with bad data"
            );
            Reaction::none()
        })
    }

    fn on_handshake_request(&mut self, envelope: &Envelope) -> Result<Reaction> {
        let public_key = envelope.announced_key()?;
        if !self.peers.insert_if_absent(&envelope.from_user_id, public_key) {
            debug!(from = %envelope.from_user_id, "peer already known, not answering");
            return Ok(Reaction::none());
        }

        info!(
            peer = %envelope.from_user_id,
            key = %short_key(&public_key),
            "peer discovered via request"
        );
        Ok(Reaction {
            reply: Some(Envelope::handshake_answer(
                &self.identity,
                envelope.from_user_id.clone(),
            )),
            event: Some(SessionEvent::PeerDiscovered {
                user_id: envelope.from_user_id.clone(),
                public_key,
            }),
        })
    }

    fn on_handshake_answer(&mut self, envelope: &Envelope) -> Result<Reaction> {
        let public_key = envelope.announced_key()?;
        if !self.peers.insert_if_absent(&envelope.from_user_id, public_key) {
            return Ok(Reaction::none());
        }

        info!(
            peer = %envelope.from_user_id,
            key = %short_key(&public_key),
            "peer discovered via answer"
        );
        Ok(Reaction::event(SessionEvent::PeerDiscovered {
            user_id: envelope.from_user_id.clone(),
            public_key,
        }))
    }

    fn on_set_master_key(&mut self, envelope: &Envelope) -> Result<Reaction> {
        let public_key = envelope.announced_key()?;
        // Last announcement wins; the sender is not checked against the registry.
        self.master_key = Some(public_key);
        info!(
            peer = %envelope.from_user_id,
            key = %short_key(&public_key),
            "master key set"
        );
        Ok(Reaction::event(SessionEvent::MasterChanged {
            user_id: envelope.from_user_id.clone(),
            public_key,
        }))
    }

    fn on_transmit(&mut self, envelope: &Envelope) -> Result<Reaction> {
        let Some(sender_key) = self.peers.get(&envelope.from_user_id) else {
            self.stats.unknown_senders += 1;
            debug!(from = %envelope.from_user_id, "dropping transmit from unknown sender");
            return Ok(Reaction::none());
        };
        let ciphertext = envelope.ciphertext()?;

        let key = self.shared_keys.get_or_derive(&self.identity, &sender_key);
        match decrypt::<Value>(&key, ciphertext) {
            Ok(payload) => {
                debug!(from = %envelope.from_user_id, "transmit payload decrypted");
                Ok(Reaction::event(SessionEvent::Payload {
                    from_user_id: envelope.from_user_id.clone(),
                    payload,
                }))
            }
            Err(e) => {
                self.stats.undecryptable += 1;
                warn!(from = %envelope.from_user_id, error = %e, "could not decrypt transmit");
                Ok(Reaction::event(SessionEvent::DecryptionFailed {
                    from_user_id: envelope.from_user_id.clone(),
                    reason: e.to_string(),
                }))
            }
        }
    }

    fn on_stop(&mut self, envelope: &Envelope) -> Reaction {
        info!(peer = %envelope.from_user_id, "peer stopped");
        Reaction::event(SessionEvent::PeerLeft {
            user_id: envelope.from_user_id.clone(),
        })
    }
}
