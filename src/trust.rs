// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trust levels.
//!
//! Applications define their own trust systems (BTBV, manual verification,
//! ...) as arbitrary strings attached to `(bare JID, identity key)` pairs.
//! The core never interprets those strings, it asks the application to
//! translate them to one of the three core levels whenever a decision has to
//! be made.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The three core trust levels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Encryption to and decryption from this identity key is allowed.
    Trusted,

    /// Explicitly not trusted, no encryption or decryption.
    Distrusted,

    /// No decision yet. Encryption requires a decision first; decryption is
    /// governed by [`UndecidedDecryptPolicy`](crate::manager::UndecidedDecryptPolicy).
    Undecided,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            Self::Trusted => "trusted",
            Self::Distrusted => "distrusted",
            Self::Undecided => "undecided",
        };
        write!(f, "{level}")
    }
}

#[derive(Debug, Error)]
pub enum TrustError {
    /// The application was asked to translate a custom trust level it does
    /// not know.
    #[error("unknown custom trust level {0:?}")]
    UnknownTrustLevel(String),
}
