// SPDX-License-Identifier: MIT OR Apache-2.0

use async_trait::async_trait;
use thiserror::Error;

use crate::bundle::Bundle;
use crate::crypto::identity::{IdentityKeyFormat, IdentityKeyPair};
use crate::device::DeviceId;
use crate::message::{DeviceMessage, KeyExchange, MessageHeader};
use crate::session::Session;

/// A backend provides the cryptography of one OMEMO version, identified by
/// its namespace: X3DH key agreement, the Double Ratchet and the content
/// encryption, together with the backend's share of the bundle (the pre key
/// secrets).
///
/// The plaintext type parameter `P` selects the plaintext representation
/// convenient for the backend's wire format, e.g. a stanza type for versions
/// using Stanza Content Encryption or a plain byte string. When multiple
/// backends are loaded, the application picks one common type all of them can
/// serialize.
///
/// Persistence contract: a backend never persists anything itself. Its state
/// is loaded through [`load_or_create`](Backend::load_or_create), exposed as
/// a serializable blob through [`serialize_state`](Backend::serialize_state)
/// and written through storage by the core after the mutating operation
/// succeeded. [`restore_state`](Backend::restore_state) discards un-persisted
/// in-memory changes after a failed operation. Sessions are core-owned
/// values; a backend mutates the session passed to it (including its chain
/// lengths and the opaque ratchet blob) and the core decides whether the
/// mutation is committed.
#[async_trait]
pub trait Backend<P>: Send {
    /// The namespace provided and handled by this backend.
    fn namespace(&self) -> &str;

    /// Which representation of the identity key this backend requires.
    fn identity_key_format(&self) -> IdentityKeyFormat;

    /// Initialises in-memory state from the shared identity key pair and the
    /// previously persisted state blob. Without a blob, fresh state is
    /// created (signed pre key included, timestamped with `now`; one-time
    /// pre keys are generated separately by the core's bootstrap).
    async fn load_or_create(
        &mut self,
        identity: &IdentityKeyPair,
        state: Option<&[u8]>,
        now: u64,
    ) -> Result<(), BackendError>;

    /// Serializes the full backend state for persistence by the core.
    fn serialize_state(&self) -> Result<Vec<u8>, BackendError>;

    /// Restores a previously serialized state, discarding any in-memory
    /// changes that were never persisted.
    fn restore_state(&mut self, state: &[u8]) -> Result<(), BackendError>;

    /// The current public bundle. Hidden pre keys are not included.
    fn bundle(&self, bare_jid: &str, device_id: DeviceId) -> Result<Bundle, BackendError>;

    /// Unix timestamp of the last signed pre key rotation.
    fn signed_pre_key_rotated_at(&self) -> u64;

    /// Rotates the signed pre key. The old key stays available for passive
    /// session building until dropped.
    async fn rotate_signed_pre_key(&mut self, now: u64) -> Result<(), BackendError>;

    /// Drops the pre-rotation signed pre key once it has been retained for a
    /// full further rotation period. Returns whether a key was dropped.
    fn drop_expired_signed_pre_key(&mut self, now: u64, retention_period: u64) -> bool;

    /// Number of one-time pre keys currently visible in the bundle.
    fn visible_pre_key_count(&self) -> usize;

    /// Generates and adds the given number of one-time pre keys.
    async fn generate_pre_keys(&mut self, count: usize) -> Result<(), BackendError>;

    /// Hides the one-time pre key consumed by this passively built session
    /// from the bundle while keeping it usable for decryption. Returns false
    /// if the key is unknown or already hidden.
    fn hide_pre_key(&mut self, session: &Session) -> bool;

    /// Deletes the one-time pre key consumed by this passively built
    /// session. Returns false if the key is unknown.
    fn delete_pre_key(&mut self, session: &Session) -> bool;

    /// Deletes all pre keys previously hidden via [`hide_pre_key`](Backend::hide_pre_key).
    fn delete_hidden_pre_keys(&mut self);

    /// Actively builds a session towards a device from its downloaded
    /// bundle. The returned session carries the key exchange to attach to
    /// outgoing messages until confirmation.
    async fn build_active_session(
        &mut self,
        bare_jid: &str,
        device_id: DeviceId,
        bundle: &Bundle,
    ) -> Result<Session, BackendError>;

    /// Passively builds a session from an incoming pre-key message,
    /// decrypting the embedded initial message in the process.
    ///
    /// The referenced one-time pre key is looked up among visible *and*
    /// hidden pre keys; it is not removed here, the core decides between
    /// hiding and deletion depending on catch-up state.
    async fn build_passive_session(
        &mut self,
        bare_jid: &str,
        device_id: DeviceId,
        key_exchange: &KeyExchange,
        header: &MessageHeader,
        ciphertext: &[u8],
    ) -> Result<(Session, Vec<u8>), BackendError>;

    /// Encrypts serialized plaintext for one device, advancing the session's
    /// sending chain.
    async fn encrypt(
        &mut self,
        session: &mut Session,
        plaintext: &[u8],
    ) -> Result<DeviceMessage, BackendError>;

    /// Decrypts one message, advancing the session's receiving chain.
    async fn decrypt(
        &mut self,
        session: &mut Session,
        header: &MessageHeader,
        ciphertext: &[u8],
        max_skipped_per_session: u64,
        max_skipped_per_message: u64,
    ) -> Result<Vec<u8>, BackendError>;

    /// Serializes an application plaintext to the bytes this backend encrypts.
    fn serialize_plaintext(&self, plaintext: &P) -> Result<Vec<u8>, BackendError>;

    /// Inverse of [`serialize_plaintext`](Backend::serialize_plaintext).
    fn deserialize_plaintext(&self, bytes: &[u8]) -> Result<P, BackendError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    /// No session exists for the device and none can be built from the
    /// message at hand.
    #[error("no session exists for this device")]
    NoSession,

    /// A pre-key message referenced a one-time pre key that no longer
    /// exists. Repeats of the initial message cause this once the pre key
    /// has been deleted after catch-up.
    #[error("pre-key message refers to an already consumed one-time pre key")]
    DuplicatedPreKeyMessage,

    /// The session cannot process the message and will not recover.
    #[error("session broken: {0}")]
    SessionBroken(String),

    /// The remote bundle failed validation.
    #[error("bundle corrupted: {0}")]
    BundleCorrupted(String),

    /// The message skips more message keys than the configured limit allows.
    #[error("message skips {skipped} message keys, only {allowed} allowed")]
    TooManySkippedMessageKeys { skipped: u64, allowed: u64 },

    /// The key agreement during session building failed.
    #[error("key exchange failed: {0}")]
    KeyExchangeFailed(String),

    /// The stored identity key cannot serve this backend's required format.
    /// Only possible when loading a historical account; resolved by
    /// regenerating the identity key (which resets trust).
    #[error("identity key format is incompatible with this backend")]
    IdentityKeyFormatIncompatible,

    /// Plaintext (de)serialization failed.
    #[error("plaintext serialization failed: {0}")]
    Plaintext(String),

    /// Backend state blob (de)serialization failed.
    #[error("backend state serialization failed: {0}")]
    State(String),
}
