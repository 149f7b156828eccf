//! Encrypted token vault
//!
//! API credentials are stored AES-256-GCM encrypted inside the config file
//! as `iv:authTag:ciphertext`, all hex. Key material is 32 random bytes,
//! hex-encoded in a sibling `.key` file created once with owner-only read
//! permission and never rewritten. A missing key file means any stored
//! token is unrecoverable, never an excuse to mint a new key over it.

use crate::config::ConfigStore;
use crate::error::{Error, Result};
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce};
use rand::RngCore;
use std::path::PathBuf;

/// GCM with the 16-byte IV this vault's wire format uses.
type TokenCipher = AesGcm<Aes256, U16>;

const KEY_BYTES: usize = 32;
const IV_BYTES: usize = 16;
const TAG_BYTES: usize = 16;

/// Tokens shorter than this are rejected outright.
const MIN_TOKEN_LEN: usize = 10;

/// Vault over the config file and its sibling key file.
pub struct TokenStore {
    config: ConfigStore,
    key_path: PathBuf,
}

impl TokenStore {
    /// Vault with the key file next to the config file.
    pub fn new(config: ConfigStore) -> Self {
        let key_path = config
            .path()
            .parent()
            .map(|p| p.join(".key"))
            .unwrap_or_else(crate::config::key_path);
        Self { config, key_path }
    }

    /// Vault with an explicit key path (for tests).
    pub fn with_key_path(config: ConfigStore, key_path: PathBuf) -> Self {
        Self { config, key_path }
    }

    /// Encrypt and persist a token.
    ///
    /// Rejects empty or short tokens before any write. Each call uses a
    /// fresh random IV, so encrypting the same token twice produces
    /// different ciphertexts.
    pub fn store_token(&self, plaintext: &str) -> Result<()> {
        if plaintext.is_empty() {
            return Err(Error::InvalidInput("token must not be empty".to_string()));
        }
        if plaintext.len() < MIN_TOKEN_LEN {
            return Err(Error::InvalidInput(format!(
                "token must be at least {} characters",
                MIN_TOKEN_LEN
            )));
        }

        let key = self.load_or_create_key()?;
        let cipher = TokenCipher::new(Key::<TokenCipher>::from_slice(&key));

        let mut iv = [0u8; IV_BYTES];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::<U16>::from_slice(&iv);

        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| Error::Auth("token encryption failed".to_string()))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_BYTES);

        let stored = format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ciphertext)
        );
        self.config.update(|c| c.token = Some(stored))?;
        Ok(())
    }

    /// Decrypt the stored token.
    ///
    /// Returns `None` when the config or key file is missing, the token
    /// field is absent or malformed, or authentication fails.
    pub fn get_token(&self) -> Option<String> {
        let stored = self.config.get().token?;
        let key = self.load_key()?;

        let mut parts = stored.splitn(3, ':');
        let iv = hex::decode(parts.next()?).ok()?;
        let tag = hex::decode(parts.next()?).ok()?;
        let ciphertext = hex::decode(parts.next()?).ok()?;
        if iv.len() != IV_BYTES || tag.len() != TAG_BYTES {
            tracing::debug!("Stored token has malformed iv or tag");
            return None;
        }

        let cipher = TokenCipher::new(Key::<TokenCipher>::from_slice(&key));
        let nonce = Nonce::<U16>::from_slice(&iv);
        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        match cipher.decrypt(nonce, sealed.as_slice()) {
            Ok(plaintext) => String::from_utf8(plaintext).ok(),
            Err(_) => {
                tracing::debug!("Token authentication failed");
                None
            }
        }
    }

    pub fn has_token(&self) -> bool {
        self.get_token().is_some()
    }

    /// Remove the token, preserving every other config field.
    pub fn clear_token(&self) -> Result<()> {
        self.config.update(|c| c.token = None)?;
        Ok(())
    }

    fn load_key(&self) -> Option<[u8; KEY_BYTES]> {
        let content = std::fs::read_to_string(&self.key_path).ok()?;
        let bytes = hex::decode(content.trim()).ok()?;
        bytes.try_into().ok()
    }

    /// Load the key, creating it only when the file is absent. An existing
    /// but unreadable key is an error: rewriting it would orphan every
    /// previously stored token.
    fn load_or_create_key(&self) -> Result<[u8; KEY_BYTES]> {
        if self.key_path.exists() {
            return self
                .load_key()
                .ok_or_else(|| Error::Auth("key file exists but is unreadable".to_string()));
        }

        if let Some(parent) = self.key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut key = [0u8; KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut key);
        std::fs::write(&self.key_path, hex::encode(key))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.key_path, std::fs::Permissions::from_mode(0o400))?;
        }

        Ok(key)
    }
}
