//! Credential encryption at rest.
//!
//! Blobs are `base64(nonce || ciphertext || tag)` sealed with AES-256-GCM.
//! The key is the SHA-256 digest of two installation secrets.  Anyone holding
//! both secrets and this code can recover the key; the scheme only keeps
//! credentials out of plain sight in database dumps.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to generate random nonce")]
    Random,
    #[error("encryption failed")]
    Seal,
    #[error("stored value is not valid base64")]
    Encoding,
    #[error("stored value is too short")]
    Truncated,
    #[error("decryption failed (wrong key or corrupted data)")]
    Open,
    #[error("decrypted value is not valid UTF-8")]
    Utf8,
}

/// Symmetric codec for secrets stored in text columns.
#[derive(Clone)]
pub struct SecretCodec {
    key: [u8; 32],
    rng: SystemRandom,
}

impl std::fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCodec").finish_non_exhaustive()
    }
}

impl SecretCodec {
    /// Derive the codec key from the two long-lived installation secrets.
    pub fn from_secrets(auth_key: &str, secure_auth_key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(auth_key.as_bytes());
        hasher.update(secure_auth_key.as_bytes());
        let key: [u8; 32] = hasher.finalize().into();
        Self {
            key,
            rng: SystemRandom::new(),
        }
    }

    fn sealing_key(&self) -> Result<LessSafeKey, CodecError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| CodecError::Seal)?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Encrypt `plaintext`.  The empty string maps to the empty string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CodecError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let key = self.sealing_key()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CodecError::Random)?;
        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| CodecError::Seal)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + in_out.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&in_out);
        Ok(STANDARD.encode(blob))
    }

    /// Decrypt a blob produced by [`SecretCodec::encrypt`].  The empty string
    /// maps to the empty string.
    pub fn decrypt(&self, blob: &str) -> Result<String, CodecError> {
        if blob.is_empty() {
            return Ok(String::new());
        }
        let decoded = STANDARD
            .decode(blob.trim())
            .map_err(|_| CodecError::Encoding)?;
        if decoded.len() <= NONCE_LEN {
            return Err(CodecError::Truncated);
        }
        let (nonce_part, sealed) = decoded.split_at(NONCE_LEN);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce_part);

        let key = self.sealing_key()?;
        let mut in_out = sealed.to_vec();
        let plain = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CodecError::Open)?;
        String::from_utf8(plain.to_vec()).map_err(|_| CodecError::Utf8)
    }
}
