// SPDX-License-Identifier: MIT OR Apache-2.0

//! HKDF-SHA256 helper, offered to backend implementations for key derivation.
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

/// HKDF-SHA256 with optional salt, expanding into an output array of the requested size.
pub fn hkdf<const N: usize>(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
) -> Result<[u8; N], HkdfError> {
    let mut output = [0u8; N];
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    hkdf.expand(info, &mut output)
        .map_err(|_| HkdfError::InvalidLength)?;
    Ok(output)
}

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("requested hkdf output length is invalid")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::hkdf;

    #[test]
    fn deterministic_and_domain_separated() {
        let okm_1: [u8; 32] = hkdf(None, b"input", b"info").unwrap();
        let okm_2: [u8; 32] = hkdf(None, b"input", b"info").unwrap();
        let okm_3: [u8; 32] = hkdf(None, b"input", b"other").unwrap();

        assert_eq!(okm_1, okm_2);
        assert_ne!(okm_1, okm_3);
    }
}
