//! Sealing of stored panel passwords.
//!
//! Panel passwords are stored sealed with AES-256-GCM. The key is the SHA-256
//! digest of the operator-provided secret. The stored form is
//!
//! ```text
//! base64(nonce || ciphertext || tag)
//! ```
//!
//! Plaintext is only produced by [`CredentialCipher::open`] for the duration
//! of a single device call.

use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::digest::{SHA256, digest};
use std::sync::Arc;

/// Errors produced by credential sealing.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential key is empty")]
    EmptyKey,
    #[error("invalid base64 encoding")]
    InvalidBase64,
    #[error("sealed credential is truncated")]
    Truncated,
    #[error("credential could not be opened with this key")]
    OpenFailed,
    #[error("credential is not valid UTF-8")]
    NotUtf8,
}

impl From<ring::error::Unspecified> for CredentialError {
    fn from(_: ring::error::Unspecified) -> Self {
        Self::OpenFailed
    }
}

#[derive(Clone)]
pub struct CredentialCipher {
    key: Arc<LessSafeKey>,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    /// Derive the cipher from an operator secret.
    pub fn from_secret(secret: &str) -> Result<Self, CredentialError> {
        if secret.is_empty() {
            return Err(CredentialError::EmptyKey);
        }
        let key_bytes = digest(&SHA256, secret.as_bytes());
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes.as_ref())?;
        Ok(Self {
            key: Arc::new(LessSafeKey::new(unbound)),
        })
    }

    /// Seal a plaintext password with a fresh random nonce.
    pub fn seal(&self, plaintext: &str) -> Result<String, CredentialError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let mut in_out = plaintext.as_bytes().to_vec();
        self.key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(fast32::base64::RFC4648_NOPAD.encode(&sealed))
    }

    /// Open a sealed password.
    pub fn open(&self, sealed: &str) -> Result<String, CredentialError> {
        let mut raw = fast32::base64::RFC4648_NOPAD
            .decode_str(sealed)
            .map_err(|_| CredentialError::InvalidBase64)?;
        if raw.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(CredentialError::Truncated);
        }

        let (nonce, body) = raw.split_at_mut(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)?;
        let plaintext = self.key.open_in_place(nonce, Aad::empty(), body)?;
        String::from_utf8(plaintext.to_vec()).map_err(|_| CredentialError::NotUtf8)
    }
}
