//! At-rest encryption of encoding blobs.
//!
//! Blob layout: 12-byte random nonce, then AES-256-GCM ciphertext and tag.
//! The key is the SHA-256 digest of the key file's contents.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum SealError {
    #[error("cannot read key file {path}: {source}")]
    KeyFile {
        path: String,
        source: std::io::Error,
    },
    #[error("key file {0} is empty")]
    EmptyKey(String),
    #[error("sealed blob too short ({0} bytes)")]
    Truncated(usize),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: wrong key or tampered blob")]
    Decrypt,
}

#[derive(Clone)]
pub struct EncodingCipher {
    cipher: Aes256Gcm,
}

impl EncodingCipher {
    pub fn from_key_material(material: &[u8]) -> Self {
        let key = Sha256::digest(material);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    pub fn from_key_file(path: &Path) -> Result<Self, SealError> {
        let material = std::fs::read(path).map_err(|source| SealError::KeyFile {
            path: path.display().to_string(),
            source,
        })?;
        if material.iter().all(u8::is_ascii_whitespace) {
            return Err(SealError::EmptyKey(path.display().to_string()));
        }
        tracing::info!(path = %path.display(), "encoding encryption enabled");
        Ok(Self::from_key_material(&material))
    }

    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, SealError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| SealError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        if blob.len() <= NONCE_LEN {
            return Err(SealError::Truncated(blob.len()));
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| SealError::Decrypt)
    }
}

impl std::fmt::Debug for EncodingCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncodingCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_then_open() {
        let cipher = EncodingCipher::from_key_material(b"classroom-42");
        let plain: Vec<u8> = (0..64).collect();
        let blob = cipher.seal(&plain).unwrap();
        assert_ne!(&blob[NONCE_LEN..NONCE_LEN + plain.len()], plain.as_slice());
        assert_eq!(cipher.open(&blob).unwrap(), plain);
    }

    #[test]
    fn test_nonce_differs_per_seal() {
        let cipher = EncodingCipher::from_key_material(b"k");
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_is_refused() {
        let blob = EncodingCipher::from_key_material(b"right").seal(b"secret").unwrap();
        let err = EncodingCipher::from_key_material(b"wrong").open(&blob).unwrap_err();
        assert!(matches!(err, SealError::Decrypt));
    }

    #[test]
    fn test_tampered_blob_is_refused() {
        let cipher = EncodingCipher::from_key_material(b"k");
        let mut blob = cipher.seal(b"secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(cipher.open(&blob), Err(SealError::Decrypt)));
        assert!(matches!(cipher.open(&blob[..4]), Err(SealError::Truncated(4))));
    }

    #[test]
    fn test_missing_key_file() {
        let err = EncodingCipher::from_key_file(Path::new("/nonexistent/rollcall.key")).unwrap_err();
        assert!(matches!(err, SealError::KeyFile { .. }));
    }
}
