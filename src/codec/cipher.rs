//! Cipher stage
//!
//! ChaCha20-Poly1305 keyed from the SHA-256 of the pre-shared key. Every
//! sealed payload carries its own random nonce, so no counter state is shared
//! between the many tasks that encode with the same pipeline.

use chacha20poly1305::{aead::{Aead, KeyInit}, ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes added to a payload by `PacketCipher::seal`
pub const CIPHER_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Authenticated stream cipher for tunnelled payloads
#[derive(Clone)]
pub struct PacketCipher {
    cipher: ChaCha20Poly1305,
}

impl PacketCipher {
    pub fn new(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&digest));
        Self { cipher }
    }

    /// Encrypt, returns nonce || ciphertext || tag
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Codec("Encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a payload produced by `seal`
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < CIPHER_OVERHEAD {
            return Err(Error::Codec(format!(
                "sealed payload too short: {} bytes",
                sealed.len()
            )));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Codec("Decryption failed (invalid key or corrupted data)".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_adds_fixed_overhead() {
        let cipher = PacketCipher::new("key");
        let sealed = cipher.seal(&[0u8; 100]).unwrap();
        assert_eq!(sealed.len(), 100 + CIPHER_OVERHEAD);
    }

    #[test]
    fn test_nonces_differ_per_seal() {
        let cipher = PacketCipher::new("key");
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.open(&a).unwrap(), b"same");
        assert_eq!(cipher.open(&b).unwrap(), b"same");
    }

    #[test]
    fn test_short_input_rejected() {
        let cipher = PacketCipher::new("key");
        assert!(cipher.open(&[0u8; CIPHER_OVERHEAD - 1]).is_err());
    }
}
