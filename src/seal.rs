//
// seal.rs
// Dicom-Intake-rs
//
// Hashes the anonymized Part 10 bytes and, when enabled, encrypts them with AES-256-GCM under the process key.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use dicom::object::DefaultDicomObject;
use sha2::{Digest, Sha256};

use crate::config::SealingConfig;

/// AES-GCM nonce length (96 bits). Sealed artifacts start with the nonce.
pub const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("encryption is enabled but no key is configured (set sealing.key_hex or ${0})")]
    MissingKey(String),
    #[error("invalid sealing key: {0}")]
    InvalidKey(String),
    #[error("failed to serialize DICOM object: {0}")]
    Encode(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: artifact is corrupt or was sealed with another key")]
    Decrypt,
    #[error("artifact is encrypted but this process has no key")]
    NoKey,
}

/// Output of the sealing stage.
#[derive(Debug, Clone)]
pub struct SealedArtifact {
    /// Bytes to store: cleartext Part 10, or `nonce || ciphertext`.
    pub bytes: Vec<u8>,
    /// Hex SHA-256 of the cleartext Part 10 bytes.
    pub content_hash: String,
    pub encrypted: bool,
    /// Hex nonce, when encrypted.
    pub nonce: Option<String>,
}

pub struct Sealer {
    cipher: Option<Aes256Gcm>,
    encrypt: bool,
}

impl fmt::Debug for Sealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealer")
            .field("encrypt", &self.encrypt)
            .field("has_key", &self.cipher.is_some())
            .finish()
    }
}

impl Sealer {
    /// Resolve the process key. Any problem here is a configuration error and should stop startup.
    pub fn from_config(config: &SealingConfig) -> Result<Self, SealError> {
        let key_hex = config
            .key_hex
            .clone()
            .or_else(|| std::env::var(&config.key_env).ok());

        match key_hex {
            Some(hex_key) => Ok(Self {
                cipher: Some(cipher_from_hex(&hex_key)?),
                encrypt: config.encrypt,
            }),
            None if config.encrypt => Err(SealError::MissingKey(config.key_env.clone())),
            None => Ok(Self::plaintext()),
        }
    }

    /// Hash-only sealer.
    pub fn plaintext() -> Self {
        Self {
            cipher: None,
            encrypt: false,
        }
    }

    pub fn with_key(key: &[u8; 32]) -> Result<Self, SealError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| SealError::InvalidKey(e.to_string()))?;
        Ok(Self {
            cipher: Some(cipher),
            encrypt: true,
        })
    }

    /// Encrypting sealer that lost its key; every seal fails with `NoKey`.
    #[cfg(test)]
    pub(crate) fn keyless() -> Self {
        Self {
            cipher: None,
            encrypt: true,
        }
    }

    pub fn seal(&self, obj: &DefaultDicomObject) -> Result<SealedArtifact, SealError> {
        self.seal_bytes(encode(obj)?)
    }

    /// Hash `cleartext` and encrypt it when enabled. The hash never covers ciphertext.
    pub fn seal_bytes(&self, cleartext: Vec<u8>) -> Result<SealedArtifact, SealError> {
        let content_hash = content_hash(&cleartext);
        if !self.encrypt {
            return Ok(SealedArtifact {
                bytes: cleartext,
                content_hash,
                encrypted: false,
                nonce: None,
            });
        }

        let cipher = self.cipher.as_ref().ok_or(SealError::NoKey)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, cleartext.as_slice())
            .map_err(|_| SealError::Encrypt)?;

        let mut bytes = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        bytes.extend_from_slice(&nonce);
        bytes.extend(ciphertext);

        Ok(SealedArtifact {
            bytes,
            content_hash,
            encrypted: true,
            nonce: Some(hex::encode(nonce)),
        })
    }

    /// Recover the cleartext Part 10 bytes of a stored artifact.
    pub fn unseal(&self, stored: &[u8], encrypted: bool) -> Result<Vec<u8>, SealError> {
        if !encrypted {
            return Ok(stored.to_vec());
        }
        let cipher = self.cipher.as_ref().ok_or(SealError::NoKey)?;
        if stored.len() < NONCE_LEN {
            return Err(SealError::Decrypt);
        }
        let (nonce, ciphertext) = stored.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Decrypt)
    }
}

/// Serialize a file object as Part 10 bytes (preamble, `DICM`, meta group, dataset).
pub fn encode(obj: &DefaultDicomObject) -> Result<Vec<u8>, SealError> {
    let mut out = Vec::new();
    obj.write_all(&mut out)
        .map_err(|e| SealError::Encode(e.to_string()))?;
    Ok(out)
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn verify(bytes: &[u8], expected_hash: &str) -> bool {
    content_hash(bytes).eq_ignore_ascii_case(expected_hash)
}

/// Fresh random AES-256 key as 64 hex characters.
pub fn generate_key_hex() -> String {
    hex::encode(Aes256Gcm::generate_key(OsRng))
}

fn cipher_from_hex(key_hex: &str) -> Result<Aes256Gcm, SealError> {
    let key = hex::decode(key_hex.trim())
        .map_err(|e| SealError::InvalidKey(format!("not hex: {e}")))?;
    if key.len() != 32 {
        return Err(SealError::InvalidKey(format!(
            "key must be 32 bytes (64 hex chars), got {} bytes",
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(&key).map_err(|e| SealError::InvalidKey(e.to_string()))
}
