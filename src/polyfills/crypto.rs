use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{RepoError, Result};

/// Nonce size for AES-256-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// Replaceable decryption primitive for encrypted payload fields.
///
/// The repository hands this shim to the instance's encrypted setters; the
/// decryption key itself belongs to the instance.
#[async_trait]
pub trait Decryptor: Send + Sync {
    /// Decrypt a base64 ciphertext with a base64 key, returning plaintext
    /// (a JSON document for feature/experiment fields).
    async fn decrypt(&self, ciphertext: &str, key: &str) -> Result<String>;
}

/// Default decryptor: AES-256-GCM over base64( nonce ∥ ciphertext ∥ tag ).
pub struct AesGcmDecryptor;

#[async_trait]
impl Decryptor for AesGcmDecryptor {
    async fn decrypt(&self, ciphertext: &str, key: &str) -> Result<String> {
        let key_bytes = BASE64
            .decode(key)
            .map_err(|e| RepoError::with_source(crate::ErrorCode::DecryptFailed, "invalid key encoding", e))?;
        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| RepoError::decrypt(format!("invalid key length: {e}")))?;

        let encrypted = BASE64
            .decode(ciphertext)
            .map_err(|e| RepoError::with_source(crate::ErrorCode::DecryptFailed, "invalid ciphertext encoding", e))?;
        if encrypted.len() < NONCE_SIZE {
            return Err(RepoError::decrypt("ciphertext too short"));
        }

        let (nonce_bytes, payload) = encrypted.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, payload)
            .map_err(|e| RepoError::decrypt(format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| RepoError::with_source(crate::ErrorCode::DecryptFailed, "plaintext is not utf-8", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt(plaintext: &str, key: &[u8; 32]) -> String {
        let cipher = Aes256Gcm::new_from_slice(key).unwrap();
        let nonce_bytes: [u8; NONCE_SIZE] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, plaintext.as_bytes()).unwrap();

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend(ciphertext);
        BASE64.encode(out)
    }

    #[tokio::test]
    async fn test_decrypt_round_trip() {
        let key = [7u8; 32];
        let ciphertext = encrypt(r#"{"f1":{"defaultValue":true}}"#, &key);

        let decryptor = AesGcmDecryptor;
        let plaintext = decryptor
            .decrypt(&ciphertext, &BASE64.encode(key))
            .await
            .unwrap();

        assert_eq!(plaintext, r#"{"f1":{"defaultValue":true}}"#);
    }

    #[tokio::test]
    async fn test_decrypt_rejects_wrong_key() {
        let ciphertext = encrypt("{}", &[7u8; 32]);

        let decryptor = AesGcmDecryptor;
        let result = decryptor.decrypt(&ciphertext, &BASE64.encode([8u8; 32])).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_decrypt_rejects_short_ciphertext() {
        let decryptor = AesGcmDecryptor;
        let result = decryptor
            .decrypt(&BASE64.encode([0u8; 4]), &BASE64.encode([7u8; 32]))
            .await;

        assert!(result.is_err());
    }
}
