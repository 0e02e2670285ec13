//! Per-chunk authenticated encryption.
//!
//! Every chunk is sealed with its own freshly generated AES-256-GCM key
//! and 96-bit nonce. The key material travels next to the ciphertext in
//! [`EncryptionDetails`], so this only hides chunk contents from parties
//! that cannot read the data channel itself; the channel's transport
//! encryption is the actual security boundary.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{ProtocolError, Result};
use crate::messages::EncryptionDetails;

/// AES-256 key length in bytes.
pub const KEY_LENGTH: usize = 32;

/// AES-GCM nonce length in bytes.
pub const NONCE_LENGTH: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LENGTH: usize = 16;

/// Key and nonce for exactly one chunk.
///
/// Never reuse a `ChunkKey` for a second chunk; call [`ChunkKey::generate`]
/// per chunk instead.
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkKey {
    key: [u8; KEY_LENGTH],
    nonce: [u8; NONCE_LENGTH],
}

impl ChunkKey {
    /// Generates a random key and nonce from the OS RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut nonce);
        Self { key, nonce }
    }

    /// Rebuilds a key from wire details, validating lengths.
    pub fn from_details(details: &EncryptionDetails) -> Result<Self> {
        if details.key.len() != KEY_LENGTH {
            return Err(ProtocolError::InvalidKeyMaterial {
                expected: KEY_LENGTH,
                got: details.key.len(),
            });
        }
        if details.iv.len() != NONCE_LENGTH {
            return Err(ProtocolError::InvalidKeyMaterial {
                expected: NONCE_LENGTH,
                got: details.iv.len(),
            });
        }

        let mut key = [0u8; KEY_LENGTH];
        let mut nonce = [0u8; NONCE_LENGTH];
        key.copy_from_slice(&details.key);
        nonce.copy_from_slice(&details.iv);
        Ok(Self { key, nonce })
    }

    /// Exports the key material for the wire.
    pub fn to_details(&self) -> EncryptionDetails {
        EncryptionDetails {
            key: self.key.to_vec(),
            iv: self.nonce.to_vec(),
        }
    }

    #[allow(deprecated)]
    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    /// Encrypts `plaintext`, returning ciphertext with the tag appended.
    #[allow(deprecated)]
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .encrypt(Nonce::from_slice(&self.nonce), plaintext)
            .map_err(|e| ProtocolError::Encryption(e.to_string()))
    }

    /// Decrypts and authenticates `ciphertext`.
    #[allow(deprecated)]
    pub fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LENGTH {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }
        self.cipher()
            .decrypt(Nonce::from_slice(&self.nonce), ciphertext)
            .map_err(|_| ProtocolError::Decryption("authentication tag mismatch".to_string()))
    }
}

impl std::fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkKey")
            .field("key", &"[REDACTED]")
            .field("nonce", &"[REDACTED]")
            .finish()
    }
}

/// Encrypts one chunk with a fresh key, returning ciphertext and key details.
pub fn seal_chunk(plaintext: &[u8]) -> Result<(Vec<u8>, EncryptionDetails)> {
    let key = ChunkKey::generate();
    let ciphertext = key.seal(plaintext)?;
    Ok((ciphertext, key.to_details()))
}

/// Decrypts one chunk using the details that accompanied it.
pub fn open_chunk(ciphertext: &[u8], details: &EncryptionDetails) -> Result<Vec<u8>> {
    ChunkKey::from_details(details)?.open(ciphertext)
}
