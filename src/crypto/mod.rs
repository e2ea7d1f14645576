// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic helpers of the core and random number generation.
//!
//! The core deliberately implements very little cryptography itself. The only
//! primitive it owns is the identity key (an Ed25519 seed with a Curve25519
//! counterpart, see [`identity`]); signature handling uses XEdDSA so a single
//! key pair serves both signing and Diffie-Hellman. The AEAD and HKDF modules
//! are convenience helpers for backend implementations, the core never
//! encrypts message content on its own.
//!
//! Random Number Generator:
//! - ChaCha20 stream cipher, seeded via `getrandom`
pub mod aead;
pub mod hkdf;
pub mod identity;
mod rng;
mod secret;
pub mod sha2;
pub mod x25519;
pub mod xeddsa;

pub use rng::{Rng, RngError};
pub use secret::Secret;
