// SPDX-License-Identifier: MIT OR Apache-2.0

//! `omemo-core` is the cross-backend session management core of an OMEMO
//! (XEP-0384) end-to-end encrypted messaging library.
//!
//! OMEMO exists in several protocol versions, each with its own namespace
//! and wire format but all built on X3DH key agreement and a Double Ratchet.
//! This crate composes any number of per-version backends into one coherent
//! session manager a chat application drives: it owns the identity key all
//! backends share, the device-list caches across accounts, the own bundle
//! lifecycle (signed pre key rotation, one-time pre key replenishment),
//! trust evaluation, per-recipient message dispatch with transparent session
//! establishment, a catch-up mode that tolerates historical replays, and the
//! automated staleness responses that keep the ratchets moving.
//!
//! ## What stays outside
//!
//! The crate is deliberately transport- and storage-agnostic. The
//! application provides:
//!
//! - a [`Storage`](traits::Storage) implementation, an opaque key-value
//!   store with durable, write-through semantics,
//! - a [`Transport`](traits::Transport) implementation covering PEP access
//!   (device lists, bundles) and the sending of empty OMEMO messages,
//! - a [`TrustCallback`](traits::TrustCallback) translating the
//!   application's custom trust system to the three core levels,
//! - one [`Backend`](traits::Backend) per OMEMO version to support, which
//!   implements the actual cryptography. XML (de)serialization belongs to
//!   the application as well.
//!
//! ## Consistency
//!
//! Every operation persists the session and key state it mutated before it
//! returns a result: no plaintext and no ciphertext ever leaves the core
//! without its corresponding ratchet movement being committed. Forward
//! secrecy makes this the one non-negotiable rule of the crate.
//!
//! ## Catch-up mode
//!
//! Clients replaying history (e.g. from a MAM archive) start the manager in
//! catch-up mode: used one-time pre keys are retained so repeated copies of
//! an initial message still decrypt, signed pre key rotation is deferred and
//! the automated empty responses are queued. Ending catch-up flushes all of
//! it.
pub mod bundle;
mod cbor;
pub mod crypto;
pub mod device;
pub mod manager;
pub mod message;
pub mod session;
mod storage;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod traits;
pub mod trust;

pub use bundle::{Bundle, MAX_ONE_TIME_PRE_KEYS, OneTimePreKey, PreKeyId, SignedPreKey};
pub use cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
pub use crypto::identity::{IdentityKey, IdentityKeyFormat, IdentityKeyPair, format_identity_key};
pub use crypto::{Rng, RngError};
pub use device::{DeviceId, DeviceInformation};
pub use manager::{
    CatchUpError, CreateError, CreateReport, DecryptError, DeviceListError, EncryptError,
    MaintenanceError, STALENESS_MAGIC_NUMBER, SessionManager, SessionManagerConfig,
    UndecidedDecryptPolicy,
};
pub use message::{
    DecryptedMessage, DeviceMessage, EncryptFailureReason, EncryptedMessage, EncryptionFailure,
    IncomingMessage, KeyExchange, MessageHeader,
};
pub use session::{Initiation, Session};
#[cfg(feature = "memory")]
pub use storage::MemoryStorage;
pub use trust::{TrustError, TrustLevel};
