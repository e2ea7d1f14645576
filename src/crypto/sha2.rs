// SPDX-License-Identifier: MIT OR Apache-2.0

use sha2::{Digest, Sha256, Sha512};

/// SHA2-256 digest over a concatenation of byte slices.
pub fn sha2_256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// SHA2-512 digest over a concatenation of byte slices.
pub fn sha2_512(parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}
