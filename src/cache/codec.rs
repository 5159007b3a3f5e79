//! Blob serialization: JSON with a byte-sequence marker, optionally sealed
//! with AES-GCM.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use sha2::{Digest, Sha256};

use super::error::{CacheError, CacheResult};
use crate::value::Value;

const NONCE_LEN: usize = 12;

/// Encodes blob values to on-disk bytes and back.
///
/// Without a key the payload is plain JSON (byte sequences encoded as
/// `{"_base64": true, "data": ...}`). With a key each payload is sealed
/// individually: a fresh 96-bit nonce is prepended to the AES-GCM
/// ciphertext, so equal plaintexts never produce equal files.
pub struct BlobCodec {
    cipher: Option<Aes256Gcm>,
}

impl BlobCodec {
    /// Derive the cipher from a passphrase; `None` disables encryption.
    pub fn new(passphrase: Option<&str>) -> Self {
        let cipher = passphrase.map(|p| {
            let digest = Sha256::digest(p.as_bytes());
            Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&digest))
        });
        Self { cipher }
    }

    pub fn encode(&self, value: &Value) -> CacheResult<Vec<u8>> {
        let plain = serde_json::to_vec(&value.to_json())?;
        match &self.cipher {
            None => Ok(plain),
            Some(cipher) => {
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                let sealed = cipher
                    .encrypt(&nonce, plain.as_slice())
                    .map_err(|_| CacheError::Decrypt)?;
                let mut out = nonce.to_vec();
                out.extend_from_slice(&sealed);
                Ok(out)
            }
        }
    }

    pub fn decode(&self, data: &[u8]) -> CacheResult<Value> {
        let plain = match &self.cipher {
            None => data.to_vec(),
            Some(cipher) => {
                if data.len() < NONCE_LEN {
                    return Err(CacheError::Decrypt);
                }
                let (nonce, sealed) = data.split_at(NONCE_LEN);
                cipher
                    .decrypt(Nonce::from_slice(nonce), sealed)
                    .map_err(|_| CacheError::Decrypt)?
            }
        };
        let json: serde_json::Value = serde_json::from_slice(&plain)?;
        Ok(Value::from_json(&json))
    }
}
