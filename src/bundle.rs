// SPDX-License-Identifier: MIT OR Apache-2.0

//! Public bundle of a device: the X3DH material published on the server.
//!
//! Each backend owns one bundle per namespace. The core validates structure
//! and signatures, decides when republication is due and hands bundles to the
//! application for upload; it never touches the secret halves of the keys in
//! here, those stay inside the backend.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::identity::{IdentityError, IdentityKey};
use crate::crypto::x25519::PublicKey;
use crate::crypto::xeddsa::{XEdDSAError, XSignature, xeddsa_verify};
use crate::device::DeviceId;

/// Upper limit for one-time pre keys in a bundle.
pub const MAX_ONE_TIME_PRE_KEYS: usize = 100;

/// Identifier of a (signed or one-time) pre key within one backend.
pub type PreKeyId = u32;

/// Medium-lived pre key, signed with the identity key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    id: PreKeyId,
    public_key: PublicKey,
    signature: XSignature,
    /// Unix timestamp (seconds) of the rotation that introduced this key.
    rotated_at: u64,
}

impl SignedPreKey {
    pub fn new(id: PreKeyId, public_key: PublicKey, signature: XSignature, rotated_at: u64) -> Self {
        Self {
            id,
            public_key,
            signature,
            rotated_at,
        }
    }

    pub fn id(&self) -> PreKeyId {
        self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn signature(&self) -> &XSignature {
        &self.signature
    }

    pub fn rotated_at(&self) -> u64 {
        self.rotated_at
    }

    /// Checks the XEdDSA signature over the public key under the Curve25519
    /// form of the identity key.
    pub fn verify(&self, identity_key: &IdentityKey) -> Result<(), BundleError> {
        let mont = identity_key.to_montgomery()?;
        xeddsa_verify(self.public_key.as_bytes(), &mont, &self.signature)?;
        Ok(())
    }
}

/// Short-lived pre key to be consumed by exactly one key agreement.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    id: PreKeyId,
    public_key: PublicKey,
}

impl OneTimePreKey {
    pub fn new(id: PreKeyId, public_key: PublicKey) -> Self {
        Self { id, public_key }
    }

    pub fn id(&self) -> PreKeyId {
        self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

/// The bundle of a device, containing the cryptographic information required
/// for active session building.
///
/// One-time pre keys are kept sorted by id so that structural equality does
/// not depend on the order a backend emitted them in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    namespace: String,
    bare_jid: String,
    device_id: DeviceId,
    identity_key: IdentityKey,
    signed_pre_key: SignedPreKey,
    /// Kept around for one full rotation period to serve delayed messages.
    previous_signed_pre_key: Option<SignedPreKey>,
    one_time_pre_keys: Vec<OneTimePreKey>,
}

impl Bundle {
    pub fn new(
        namespace: String,
        bare_jid: String,
        device_id: DeviceId,
        identity_key: IdentityKey,
        signed_pre_key: SignedPreKey,
        previous_signed_pre_key: Option<SignedPreKey>,
        mut one_time_pre_keys: Vec<OneTimePreKey>,
    ) -> Self {
        one_time_pre_keys.sort_by_key(|pre_key| pre_key.id());
        Self {
            namespace,
            bare_jid,
            device_id,
            identity_key,
            signed_pre_key,
            previous_signed_pre_key,
            one_time_pre_keys,
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

    pub fn identity_key(&self) -> &IdentityKey {
        &self.identity_key
    }

    pub fn signed_pre_key(&self) -> &SignedPreKey {
        &self.signed_pre_key
    }

    pub fn previous_signed_pre_key(&self) -> Option<&SignedPreKey> {
        self.previous_signed_pre_key.as_ref()
    }

    pub fn one_time_pre_keys(&self) -> &[OneTimePreKey] {
        &self.one_time_pre_keys
    }

    /// Validates the structural invariants: the one-time pre key cap and the
    /// signed pre key signature(s) under the identity key.
    pub fn verify(&self) -> Result<(), BundleError> {
        if self.one_time_pre_keys.len() > MAX_ONE_TIME_PRE_KEYS {
            return Err(BundleError::TooManyOneTimePreKeys(
                self.one_time_pre_keys.len(),
            ));
        }

        self.signed_pre_key.verify(&self.identity_key)?;
        if let Some(previous) = &self.previous_signed_pre_key {
            previous.verify(&self.identity_key)?;
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle contains {0} one-time pre keys, more than the allowed 100")]
    TooManyOneTimePreKeys(usize),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    XEdDSA(#[from] XEdDSAError),
}
