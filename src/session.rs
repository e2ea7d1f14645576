// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sessions as serializable values.
//!
//! The Double Ratchet state itself lives in the opaque `ratchet` blob and is
//! only ever interpreted by the backend that produced it. The core owns the
//! envelope: addressing, initiation direction, the pending key exchange and
//! the chain lengths it needs for staleness detection. Exactly one session
//! per `(namespace, bare JID, device id)` exists in storage; the core
//! persists a mutated session only after the operation that mutated it
//! succeeded.
use serde::{Deserialize, Serialize};

use crate::bundle::PreKeyId;
use crate::crypto::identity::IdentityKey;
use crate::device::DeviceId;
use crate::message::KeyExchange;

/// Who initiated the session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Initiation {
    /// We built the session from the peer's bundle.
    Active,

    /// The peer initiated, we built the session from their key exchange.
    Passive,
}

/// Per-remote-device session state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    namespace: String,
    bare_jid: String,
    device_id: DeviceId,
    initiation: Initiation,
    /// Set once the peer demonstrably holds the session, i.e. after the
    /// first successful decryption on an actively built session.
    confirmed: bool,
    identity_key: IdentityKey,
    /// Pending key exchange: attached to outgoing messages of unconfirmed
    /// active sessions, kept on passive sessions to recognise replays of the
    /// initial message.
    key_exchange: Option<KeyExchange>,
    /// The one-time pre key a passive session consumed, for later deletion.
    associated_pre_key: Option<PreKeyId>,
    sending_chain_length: u64,
    receiving_chain_length: u64,
    /// Backend-specific Double Ratchet state.
    #[serde(with = "serde_bytes")]
    ratchet: Vec<u8>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namespace: String,
        bare_jid: String,
        device_id: DeviceId,
        initiation: Initiation,
        identity_key: IdentityKey,
        key_exchange: Option<KeyExchange>,
        associated_pre_key: Option<PreKeyId>,
        ratchet: Vec<u8>,
    ) -> Self {
        Self {
            namespace,
            bare_jid,
            device_id,
            initiation,
            confirmed: false,
            identity_key,
            key_exchange,
            associated_pre_key,
            sending_chain_length: 0,
            receiving_chain_length: 0,
            ratchet,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn bare_jid(&self) -> &str {
        &self.bare_jid
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn initiation(&self) -> Initiation {
        self.initiation
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn identity_key(&self) -> &IdentityKey {
        &self.identity_key
    }

    pub fn key_exchange(&self) -> Option<&KeyExchange> {
        self.key_exchange.as_ref()
    }

    pub fn associated_pre_key(&self) -> Option<PreKeyId> {
        self.associated_pre_key
    }

    /// Number of messages sent over this session's current sending chain.
    pub fn sending_chain_length(&self) -> u64 {
        self.sending_chain_length
    }

    /// Number of messages received over this session's current receiving
    /// chain. At or beyond [`STALENESS_MAGIC_NUMBER`](crate::manager::STALENESS_MAGIC_NUMBER)
    /// the session counts as stale and a ratchet-forwarding response is due.
    pub fn receiving_chain_length(&self) -> u64 {
        self.receiving_chain_length
    }

    /// The opaque ratchet state, interpreted by the owning backend only.
    pub fn ratchet(&self) -> &[u8] {
        &self.ratchet
    }

    pub fn set_ratchet(&mut self, ratchet: Vec<u8>) {
        self.ratchet = ratchet;
    }

    /// Advances the sending chain length. Called by the backend per encryption.
    pub fn record_sent_message(&mut self) {
        self.sending_chain_length += 1;
    }

    /// Updates the receiving chain length. Called by the backend per decryption.
    pub fn record_received_message(&mut self, receiving_chain_length: u64) {
        self.receiving_chain_length = receiving_chain_length;
    }

    /// Marks an actively built session as confirmed, dropping the pending
    /// key exchange from future messages.
    pub fn confirm(&mut self) {
        self.confirmed = true;
        self.key_exchange = None;
    }
}
