//! Secret storage and the AES-256-GCM cipher used to decrypt it transiently
//! into a task's environment. Core never stores plaintext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret not found")]
    NotFound,
    #[error("failed to decrypt secret: {0}")]
    DecryptFailed(String),
}

/// (owner, name)-unique ciphertext row.
#[derive(Debug, Clone, FromRow)]
pub struct Secret {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub encrypted_value: String,
    pub created_at: DateTime<Utc>,
}

impl Secret {
    pub async fn find_by_name(pool: &PgPool, user_id: Uuid, name: &str) -> Result<Secret, SecretError> {
        sqlx::query_as(
            "SELECT id, user_id, name, encrypted_value, created_at FROM secrets WHERE user_id = $1 AND name = $2",
        )
        .bind(user_id)
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(|e| SecretError::DecryptFailed(e.to_string()))?
        .ok_or(SecretError::NotFound)
    }

    pub async fn upsert(
        pool: &PgPool,
        user_id: Uuid,
        name: &str,
        encrypted_value: &str,
    ) -> Result<Secret> {
        let secret = sqlx::query_as(
            r#"
            INSERT INTO secrets (user_id, name, encrypted_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, name) DO UPDATE SET encrypted_value = EXCLUDED.encrypted_value
            RETURNING id, user_id, name, encrypted_value, created_at
            "#,
        )
        .bind(user_id)
        .bind(name)
        .bind(encrypted_value)
        .fetch_one(pool)
        .await?;
        Ok(secret)
    }
}

/// AES-256-GCM encryption/decryption over the process `ENCRYPTION_KEY`.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(encryption_key: &str) -> Result<Self> {
        if encryption_key.len() != 32 {
            anyhow::bail!("encryption key must be exactly 32 bytes");
        }
        let key = Key::<Aes256Gcm>::from_slice(encryption_key.as_bytes());
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Base64(nonce || ciphertext), matching the wire format a prior
    /// implementation would have written.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, SecretError> {
        let data = BASE64
            .decode(encoded)
            .map_err(|e| SecretError::DecryptFailed(e.to_string()))?;
        if data.len() < 12 {
            return Err(SecretError::DecryptFailed("ciphertext too short".into()));
        }
        let (nonce_bytes, ct) = data.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ct)
            .map_err(|e| SecretError::DecryptFailed(e.to_string()))?;

        String::from_utf8(plaintext)
            .context("decrypted secret was not valid utf-8")
            .map_err(|e| SecretError::DecryptFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let cipher = SecretCipher::new("01234567890123456789012345678901").unwrap();
        let ciphertext = cipher.encrypt("s3cr3t").unwrap();
        assert_ne!(ciphertext, "s3cr3t");
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), "s3cr3t");
    }

    #[test]
    fn decrypt_rejects_corrupted_ciphertext() {
        let cipher = SecretCipher::new("01234567890123456789012345678901").unwrap();
        let err = cipher.decrypt("not-valid-base64-or-ciphertext!!").unwrap_err();
        assert!(matches!(err, SecretError::DecryptFailed(_)));
    }

    #[test]
    fn rejects_wrong_length_key() {
        assert!(SecretCipher::new("too-short").is_err());
    }
}
