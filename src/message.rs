// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire-facing value types.
//!
//! The core never serializes these structures for the network, the per
//! -backend wire format is a backend concern and stanza handling belongs to
//! the application. What the core produces and consumes is the structured
//! form: per-device headers and ciphertexts grouped by backend namespace.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bundle::PreKeyId;
use crate::crypto::identity::IdentityKey;
use crate::crypto::x25519::PublicKey;
use crate::device::{DeviceId, DeviceInformation};

/// The public part of an X3DH key agreement, sent along with initial
/// messages until the peer confirms the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    pub identity_key: IdentityKey,
    pub ephemeral_key: PublicKey,
    pub signed_pre_key_id: PreKeyId,
    pub pre_key_id: Option<PreKeyId>,
}

impl KeyExchange {
    /// Whether two key exchanges would build the same session.
    pub fn builds_same_session(&self, other: &KeyExchange) -> bool {
        self == other
    }
}

/// Per-message header as read by the core: the position in the sender's
/// sending chain, optional key exchange information and the backend-specific
/// header material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    counter: u64,
    key_exchange: Option<KeyExchange>,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

impl MessageHeader {
    pub fn new(counter: u64, key_exchange: Option<KeyExchange>, payload: Vec<u8>) -> Self {
        Self {
            counter,
            key_exchange,
            payload,
        }
    }

    /// Index of this message in the sender's sending chain.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn key_exchange(&self) -> Option<&KeyExchange> {
        self.key_exchange.as_ref()
    }

    /// Backend-specific header material, opaque to the core.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// What one device receives: header plus ciphertext. A pre-key message
/// carries the key exchange required for passive session building.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMessage {
    header: MessageHeader,
    #[serde(with = "serde_bytes")]
    ciphertext: Vec<u8>,
}

impl DeviceMessage {
    pub fn new(header: MessageHeader, ciphertext: Vec<u8>) -> Self {
        Self { header, ciphertext }
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn is_pre_key(&self) -> bool {
        self.header.key_exchange().is_some()
    }
}

/// Result of an encryption operation: one entry per backend namespace, each
/// carrying the per-device messages. The core does not transmit this.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    bare_jid: String,
    device_id: DeviceId,
    payloads: BTreeMap<String, BTreeMap<DeviceId, DeviceMessage>>,
}

impl EncryptedMessage {
    pub(crate) fn new(bare_jid: String, device_id: DeviceId) -> Self {
        Self {
            bare_jid,
            device_id,
            payloads: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, namespace: &str, device_id: DeviceId, message: DeviceMessage) {
        self.payloads
            .entry(namespace.to_string())
            .or_default()
            .insert(device_id, message);
    }

    /// Bare JID of the sending account.
    pub fn bare_jid(&self) -> &str {
        &self.bare_jid
    }

    /// Device id of the sending device.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn payloads(&self) -> &BTreeMap<String, BTreeMap<DeviceId, DeviceMessage>> {
        &self.payloads
    }

    /// Total number of per-device messages across all namespaces.
    pub fn device_count(&self) -> usize {
        self.payloads.values().map(BTreeMap::len).sum()
    }

    pub fn device_message(&self, namespace: &str, device_id: DeviceId) -> Option<&DeviceMessage> {
        self.payloads.get(namespace)?.get(&device_id)
    }
}

/// An incoming per-device message, as extracted from the wire by the
/// application: which backend it belongs to, who sent it, and the material
/// addressed to this device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub namespace: String,
    pub bare_jid: String,
    pub device_id: DeviceId,
    pub header: MessageHeader,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Result of a decryption operation.
#[derive(Clone, Debug)]
pub struct DecryptedMessage<P> {
    /// `None` for empty messages that only transport key material.
    pub plaintext: Option<P>,
    /// Information about the sending device.
    pub device: DeviceInformation,
    /// Set when the sender's trust level still evaluates to undecided and
    /// the configured policy allowed decryption anyway.
    pub from_undecided: bool,
}

/// Non-critical failure for a single recipient device during encryption.
/// The overall operation still succeeds for the remaining devices.
#[derive(Clone, Debug)]
pub struct EncryptionFailure {
    pub bare_jid: String,
    pub device_id: DeviceId,
    /// Namespace the failure occurred under, if one was already chosen.
    pub namespace: Option<String>,
    pub reason: EncryptFailureReason,
}

#[derive(Clone, Debug, Error)]
pub enum EncryptFailureReason {
    #[error("bundle download failed: {0}")]
    BundleDownloadFailed(String),

    #[error("no bundle published for this device")]
    BundleNotFound,

    #[error("no loaded backend matches the device's active namespaces")]
    NoEligibleBackend,

    #[error("key exchange for session building failed: {0}")]
    KeyExchangeFailed(String),

    #[error("session is broken: {0}")]
    SessionBroken(String),
}
