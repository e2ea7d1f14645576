// SPDX-License-Identifier: MIT OR Apache-2.0

//! The identity key pair of this installation, shared by all backends.
//!
//! The identity key must be able to create Ed25519-compatible signatures and
//! to perform X25519-compatible Diffie-Hellman key agreements. Both can be
//! served from one secret thanks to the birational equivalence of the two
//! curves. Newly generated identities are Ed25519 seeds; historical
//! installations may only hold the Curve25519 private scalar, which serves
//! every purpose except seed-based Ed25519 signing.
//!
//! All usages of "identity key" in the public API refer to the public part of
//! the identity key pair in Ed25519 format.
use std::fmt;

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::CompressedEdwardsY;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::sha2::sha2_512;
use crate::crypto::x25519::{self, PublicKey};
use crate::crypto::xeddsa::calculate_key_pair;
use crate::crypto::{Rng, RngError, Secret};

pub const IDENTITY_KEY_SIZE: usize = 32;

/// Public identity key in Ed25519 form. Trust decisions attach to this value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey(#[serde(with = "serde_bytes")] [u8; IDENTITY_KEY_SIZE]);

impl IdentityKey {
    pub fn from_bytes(bytes: [u8; IDENTITY_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; IDENTITY_KEY_SIZE] {
        self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Converts the Ed25519 form to its Curve25519 counterpart.
    pub fn to_montgomery(self) -> Result<PublicKey, IdentityError> {
        let point = CompressedEdwardsY(self.0)
            .decompress()
            .ok_or(IdentityError::InvalidIdentityKey)?;
        Ok(PublicKey::from_bytes(point.to_montgomery().to_bytes()))
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The identity key representation a backend requires.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityKeyFormat {
    /// The backend needs the Ed25519 seed, e.g. for standard Ed25519 signing.
    Ed,

    /// The backend only needs the Curve25519 private scalar.
    Mont,

    /// The backend works with either representation.
    Flexible,
}

/// The one identity key pair of this installation.
///
/// Persisted as the raw secret plus a tag distinguishing the two
/// representations. Generated once, never rotated by the core, destroyed only
/// by account purge.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum IdentityKeyPair {
    /// Ed25519 seed, the form generated for new installations.
    Seed(Secret<32>),

    /// Curve25519 private scalar only. Historical installations may be
    /// limited to this form; it cannot serve backends requiring [`IdentityKeyFormat::Ed`].
    Scalar(Secret<32>),
}

impl IdentityKeyPair {
    /// Generates a fresh seed-based identity key pair.
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self::Seed(Secret::from_bytes(rng.random_array()?)))
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::Seed(Secret::from_bytes(seed))
    }

    pub fn from_scalar(scalar: [u8; 32]) -> Self {
        Self::Scalar(Secret::from_bytes(scalar))
    }

    pub fn is_seed(&self) -> bool {
        matches!(self, Self::Seed(_))
    }

    /// Whether this pair can serve a backend with the given format requirement.
    pub fn supports(&self, format: IdentityKeyFormat) -> bool {
        match (self, format) {
            (Self::Scalar(_), IdentityKeyFormat::Ed) => false,
            _ => true,
        }
    }

    /// The Ed25519 seed, available only for seed-based pairs.
    pub fn seed_bytes(&self) -> Option<&[u8; 32]> {
        match self {
            Self::Seed(seed) => Some(seed.as_bytes()),
            Self::Scalar(_) => None,
        }
    }

    /// The Curve25519 private scalar, derived from the seed if necessary.
    pub fn secret_scalar(&self) -> x25519::SecretKey {
        match self {
            Self::Seed(seed) => {
                // Standard Ed25519 secret derivation: the scalar is the
                // clamped lower half of SHA-512 over the seed.
                let digest = sha2_512(&[seed.as_bytes()]);
                let mut scalar = [0u8; 32];
                scalar.copy_from_slice(&digest[..32]);
                x25519::SecretKey::from_bytes(scalar)
            }
            Self::Scalar(scalar) => x25519::SecretKey::from_bytes(*scalar.as_bytes()),
        }
    }

    /// The public identity key in Ed25519 form.
    pub fn identity_key(&self) -> IdentityKey {
        let scalar = self.secret_scalar().to_scalar();
        match self {
            Self::Seed(_) => {
                let point = (&scalar * ED25519_BASEPOINT_TABLE).compress();
                IdentityKey::from_bytes(point.0)
            }
            Self::Scalar(_) => {
                // Without the seed the natural sign bit is unknown, the
                // XEdDSA convention of a zero sign bit applies.
                let (point, _) = calculate_key_pair(scalar);
                IdentityKey::from_bytes(point.0)
            }
        }
    }

    /// The public identity key in Curve25519 form.
    pub fn mont_identity_key(&self) -> PublicKey {
        self.secret_scalar().public_key()
    }
}

/// Formats an identity key as its fingerprint: the Curve25519 form as
/// lowercase hex, in eight groups of eight chars each.
///
/// Consider applying Consistent Color Generation (XEP-0392) to each group
/// when displaying the fingerprint.
pub fn format_identity_key(identity_key: &IdentityKey) -> Result<Vec<String>, IdentityError> {
    let hex_string = identity_key.to_montgomery()?.to_hex();
    const GROUP_SIZE: usize = 8;

    Ok(hex_string
        .as_bytes()
        .chunks(GROUP_SIZE)
        .map(|group| String::from_utf8(group.to_vec()).expect("hex output is ascii"))
        .collect())
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity key is not a valid ed25519 public key")]
    InvalidIdentityKey,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;
    use crate::crypto::xeddsa::{xeddsa_sign, xeddsa_verify};

    use super::{IdentityKeyFormat, IdentityKeyPair, format_identity_key};

    #[test]
    fn montgomery_forms_agree() {
        let rng = Rng::from_seed([1; 32]);
        let pair = IdentityKeyPair::generate(&rng).unwrap();

        // The Curve25519 key derived from the public Ed25519 key matches the
        // one derived from the secret scalar.
        assert_eq!(
            pair.identity_key().to_montgomery().unwrap(),
            pair.mont_identity_key()
        );
    }

    #[test]
    fn xeddsa_signatures_verify_under_identity_key() {
        let rng = Rng::from_seed([2; 32]);
        let pair = IdentityKeyPair::generate(&rng).unwrap();

        let signature = xeddsa_sign(b"bundle data", &pair.secret_scalar(), &rng).unwrap();
        let mont = pair.identity_key().to_montgomery().unwrap();
        assert!(xeddsa_verify(b"bundle data", &mont, &signature).is_ok());
    }

    #[test]
    fn scalar_pairs_reject_ed_backends() {
        let rng = Rng::from_seed([3; 32]);
        let seed_pair = IdentityKeyPair::generate(&rng).unwrap();
        let scalar_pair = IdentityKeyPair::from_scalar(*seed_pair.secret_scalar().as_bytes());

        assert!(seed_pair.supports(IdentityKeyFormat::Ed));
        assert!(seed_pair.supports(IdentityKeyFormat::Mont));
        assert!(!scalar_pair.supports(IdentityKeyFormat::Ed));
        assert!(scalar_pair.supports(IdentityKeyFormat::Mont));
        assert!(scalar_pair.supports(IdentityKeyFormat::Flexible));
        assert!(scalar_pair.seed_bytes().is_none());

        // Both pairs share the same Curve25519 identity.
        assert_eq!(seed_pair.mont_identity_key(), scalar_pair.mont_identity_key());
    }

    #[test]
    fn fingerprint_has_eight_groups() {
        let rng = Rng::from_seed([4; 32]);
        let pair = IdentityKeyPair::generate(&rng).unwrap();

        let fingerprint = format_identity_key(&pair.identity_key()).unwrap();
        assert_eq!(fingerprint.len(), 8);
        assert!(fingerprint.iter().all(|group| group.len() == 8));
        assert_eq!(fingerprint.concat(), pair.mont_identity_key().to_hex());
    }
}
