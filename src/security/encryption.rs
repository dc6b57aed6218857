//! AES-256-GCM encryption for vault credentials at rest.
//!
//! Ciphertexts are stored as `aes256:<base64(nonce || ciphertext)>`. The
//! master key is a raw 32-byte file created by `shotcaller keygen` or on
//! first start.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::Context;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use std::path::Path;

/// Nonce size for AES-256-GCM (12 bytes / 96 bits).
const AES_GCM_NONCE_SIZE: usize = 12;

/// Prefix marking an encrypted payload.
const AES_GCM_PREFIX: &str = "aes256:";

pub struct AesEncryptor {
    key: [u8; 32],
}

impl std::fmt::Debug for AesEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesEncryptor { key: [REDACTED] }")
    }
}

impl AesEncryptor {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Fresh random key, never written anywhere.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Aes256Gcm::generate_key(OsRng));
        Self { key }
    }

    pub fn from_key_file(path: &Path) -> anyhow::Result<Self> {
        let key_bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read vault key: {}", path.display()))?;
        if key_bytes.len() != 32 {
            anyhow::bail!("vault key must be exactly 32 bytes, got {}", key_bytes.len());
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);
        Ok(Self { key })
    }

    /// Generate a random key and write it to `path` (owner-only on unix).
    /// Refuses to overwrite an existing key.
    pub fn generate_key_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            anyhow::bail!("vault key already exists: {}", path.display());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create key dir: {}", parent.display()))?;
        }
        let encryptor = Self::ephemeral();
        std::fs::write(path, encryptor.key)
            .with_context(|| format!("Failed to write vault key: {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(encryptor)
    }

    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_key_file(path)
        } else {
            tracing::info!(path = %path.display(), "generating vault key");
            Self::generate_key_file(path)
        }
    }

    fn cipher(&self) -> anyhow::Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| anyhow::anyhow!("AES cipher init failed: {e}"))
    }

    pub fn encrypt(&self, secret: &SecretString) -> anyhow::Result<String> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, secret.expose_secret().as_bytes())
            .map_err(|e| anyhow::anyhow!("AES encryption failed: {e}"))?;

        let mut combined = Vec::with_capacity(AES_GCM_NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        let encoded = base64::engine::general_purpose::STANDARD.encode(&combined);
        Ok(format!("{AES_GCM_PREFIX}{encoded}"))
    }

    pub fn decrypt(&self, encrypted: &str) -> anyhow::Result<SecretString> {
        let encoded = encrypted
            .strip_prefix(AES_GCM_PREFIX)
            .ok_or_else(|| anyhow::anyhow!("missing AES-256-GCM prefix"))?;
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("invalid base64 in encrypted payload")?;
        if combined.len() < AES_GCM_NONCE_SIZE {
            anyhow::bail!("ciphertext too short");
        }

        let (nonce_bytes, ciphertext) = combined.split_at(AES_GCM_NONCE_SIZE);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| anyhow::anyhow!("AES decryption failed: {e}"))?;

        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| anyhow::anyhow!("decrypted secret is not valid UTF-8"))?;
        Ok(SecretString::from(plaintext))
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(AES_GCM_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let encryptor = AesEncryptor::ephemeral();
        let secret = SecretString::from("sk-live-abcdef0123456789");

        let encrypted = encryptor.encrypt(&secret).unwrap();
        assert!(encrypted.starts_with(AES_GCM_PREFIX));
        assert!(!encrypted.contains("sk-live"));

        let decrypted = encryptor.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted.expose_secret(), "sk-live-abcdef0123456789");
    }

    #[test]
    fn same_secret_encrypts_differently_each_time() {
        let encryptor = AesEncryptor::ephemeral();
        let secret = SecretString::from("sk-same");
        assert_ne!(
            encryptor.encrypt(&secret).unwrap(),
            encryptor.encrypt(&secret).unwrap()
        );
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let enc1 = AesEncryptor::ephemeral();
        let enc2 = AesEncryptor::ephemeral();
        let encrypted = enc1.encrypt(&SecretString::from("secret")).unwrap();
        assert!(enc2.decrypt(&encrypted).is_err());
    }

    #[test]
    fn is_encrypted_detects_prefix() {
        assert!(AesEncryptor::is_encrypted("aes256:AAAA"));
        assert!(!AesEncryptor::is_encrypted("sk-plain"));
    }

    #[test]
    fn key_file_generate_and_load() {
        let tmp = TempDir::new().unwrap();
        let key_path = tmp.path().join("keys").join("vault.key");

        let enc1 = AesEncryptor::generate_key_file(&key_path).unwrap();
        let enc2 = AesEncryptor::load_or_generate(&key_path).unwrap();

        let encrypted = enc1.encrypt(&SecretString::from("test")).unwrap();
        assert_eq!(enc2.decrypt(&encrypted).unwrap().expose_secret(), "test");
        assert!(AesEncryptor::generate_key_file(&key_path).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let key_path = tmp.path().join("vault.key");
        AesEncryptor::generate_key_file(&key_path).unwrap();
        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn short_key_file_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let key_path = tmp.path().join("vault.key");
        std::fs::write(&key_path, [1u8; 16]).unwrap();
        assert!(AesEncryptor::from_key_file(&key_path).is_err());
    }

    #[test]
    fn decrypt_truncated_ciphertext_fails() {
        let encryptor = AesEncryptor::new([0u8; 32]);
        assert!(encryptor.decrypt("aes256:AQID").is_err());
        assert!(encryptor.decrypt("plain").is_err());
    }

    #[test]
    fn debug_hides_key() {
        let rendered = format!("{:?}", AesEncryptor::new([7u8; 32]));
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains('7'));
    }
}
