//! At-rest protection of stored token details (AES-256-GCM).

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Format tag for sealed strings: `s1.<nonce-b64url>.<ciphertext-b64url>`.
const FORMAT_PREFIX: &str = "s1";

/// Seals and unseals token details with a store-wide secret.
///
/// The 256-bit key is derived from the secret with SHA-256; each seal uses a
/// fresh random 96-bit nonce. Unsealing reproduces the exact pre-seal value
/// set or fails — tampered data or a rotated secret never yields partial
/// output.
pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    pub fn new(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// True when a stored `details` value is in the sealed string format.
    pub fn is_sealed(value: &str) -> bool {
        let mut parts = value.split('.');
        parts.next() == Some(FORMAT_PREFIX)
            && parts.clone().count() == 2
            && parts.all(|part| !part.is_empty())
    }

    pub fn seal(&self, details: &Value) -> Result<String> {
        let plaintext = serde_json::to_vec(details)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| Error::Decryption("sealing token details failed".into()))?;
        Ok(format!(
            "{FORMAT_PREFIX}.{}.{}",
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(&ciphertext)
        ))
    }

    pub fn unseal(&self, sealed: &str) -> Result<Value> {
        let parts: Vec<&str> = sealed.split('.').collect();
        let [prefix, nonce, ciphertext] = parts.as_slice() else {
            return Err(Error::Decryption("malformed sealed value".into()));
        };
        if *prefix != FORMAT_PREFIX {
            return Err(Error::Decryption(format!(
                "unsupported sealed format {prefix}"
            )));
        }
        let nonce = URL_SAFE_NO_PAD
            .decode(nonce)
            .map_err(|_| Error::Decryption("malformed sealed nonce".into()))?;
        if nonce.len() != 12 {
            return Err(Error::Decryption("malformed sealed nonce".into()));
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext)
            .map_err(|_| Error::Decryption("malformed sealed payload".into()))?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| Error::Decryption("unsealing failed, wrong secret or tampered data".into()))?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
