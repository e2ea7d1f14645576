// SPDX-License-Identifier: MIT OR Apache-2.0

//! ChaCha20-Poly1305 AEAD helpers.
//!
//! The core never encrypts message content itself, this module exists as a
//! building block for backend implementations (and is used by the bundled
//! test backend).
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use thiserror::Error;

pub const AEAD_KEY_SIZE: usize = 32;

pub const AEAD_NONCE_SIZE: usize = 12;

pub fn aead_encrypt(
    key: &[u8; AEAD_KEY_SIZE],
    nonce: [u8; AEAD_NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| AeadError::InvalidKey)?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::EncryptFailed)?;
    Ok(ciphertext)
}

pub fn aead_decrypt(
    key: &[u8; AEAD_KEY_SIZE],
    nonce: [u8; AEAD_NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| AeadError::InvalidKey)?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::DecryptFailed)?;
    Ok(plaintext)
}

#[derive(Debug, Error)]
pub enum AeadError {
    #[error("invalid aead key length")]
    InvalidKey,

    #[error("aead encryption failed")]
    EncryptFailed,

    #[error("aead decryption failed, ciphertext or tag invalid")]
    DecryptFailed,
}

#[cfg(test)]
mod tests {
    use super::{aead_decrypt, aead_encrypt};

    #[test]
    fn encrypt_decrypt() {
        let key = [9; 32];
        let nonce = [2; 12];

        let ciphertext = aead_encrypt(&key, nonce, b"hello", b"aad").unwrap();
        assert_eq!(
            aead_decrypt(&key, nonce, &ciphertext, b"aad").unwrap(),
            b"hello"
        );

        // Tampered associated data is rejected.
        assert!(aead_decrypt(&key, nonce, &ciphertext, b"bad").is_err());

        // Tampered ciphertext is rejected.
        let mut tampered = ciphertext;
        tampered[0] ^= 1;
        assert!(aead_decrypt(&key, nonce, &tampered, b"aad").is_err());
    }
}
