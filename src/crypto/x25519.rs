// SPDX-License-Identifier: MIT OR Apache-2.0

//! X25519 key types used for pre keys, ephemeral keys and the Curve25519 form
//! of the identity key.
use std::fmt;

use curve25519_dalek::scalar::clamp_integer;
use curve25519_dalek::{MontgomeryPoint, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::Secret;

pub const PUBLIC_KEY_SIZE: usize = 32;

pub const SECRET_KEY_SIZE: usize = 32;

/// X25519 public key (Montgomery u-coordinate).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes")] [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// X25519 secret key. Bytes are clamped on construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(Secret<SECRET_KEY_SIZE>);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(Secret::from_bytes(clamp_integer(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        self.0.as_bytes()
    }

    pub(crate) fn to_scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(*self.as_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(MontgomeryPoint::mul_base(&self.to_scalar()).to_bytes())
    }

    /// Diffie-Hellman agreement with another party's public key.
    ///
    /// Rejects contributory-weak results (all-zero shared secret).
    pub fn calculate_agreement(&self, their_key: &PublicKey) -> Result<[u8; 32], X25519Error> {
        let shared = (MontgomeryPoint(their_key.to_bytes()) * self.to_scalar()).to_bytes();
        if shared == [0; 32] {
            return Err(X25519Error::NonContributory);
        }
        Ok(shared)
    }
}

#[derive(Debug, Error)]
pub enum X25519Error {
    #[error("x25519 key agreement produced an all-zero shared secret")]
    NonContributory,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::SecretKey;

    #[test]
    fn agreement_is_symmetric() {
        let rng = Rng::from_seed([1; 32]);

        let alice = SecretKey::from_bytes(rng.random_array().unwrap());
        let bob = SecretKey::from_bytes(rng.random_array().unwrap());

        let alice_shared = alice.calculate_agreement(&bob.public_key()).unwrap();
        let bob_shared = bob.calculate_agreement(&alice.public_key()).unwrap();

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn distinct_keys_distinct_secrets() {
        let rng = Rng::from_seed([2; 32]);

        let alice = SecretKey::from_bytes(rng.random_array().unwrap());
        let bob = SecretKey::from_bytes(rng.random_array().unwrap());
        let carol = SecretKey::from_bytes(rng.random_array().unwrap());

        assert_ne!(
            alice.calculate_agreement(&bob.public_key()).unwrap(),
            alice.calculate_agreement(&carol.public_key()).unwrap()
        );
    }
}
