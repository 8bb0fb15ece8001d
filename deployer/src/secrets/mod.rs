//! Encryption of deploy keys and environment secrets at rest.
//!
//! Values are sealed with AES-256-GCM and stored as
//! `base64(nonce || ciphertext)`. The key is derived from operator-supplied
//! material and must be configured before the deployer starts; there is no
//! generated fallback.

use std::collections::BTreeMap;
use std::path::PathBuf;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::errors::DeployerError;
use crate::storage::settings::SecretSettings;

const NONCE_LEN: usize = 12;

/// Decrypted secret entries of an environment
pub type SecretMap = BTreeMap<String, SecretString>;

/// Origin of the key material
#[derive(Debug, Clone)]
pub enum KeySource {
    Env(String),
    File(PathBuf),
}

pub struct SecretStore {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretStore")
    }
}

impl SecretStore {
    /// Build a store from raw key material of any length
    pub fn from_material(material: &SecretString) -> Result<Self, DeployerError> {
        let material = material.expose_secret().trim();
        if material.is_empty() {
            return Err(DeployerError::SecretError(
                "Encryption key material is empty".to_string(),
            ));
        }
        let key = Sha256::digest(material.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| DeployerError::SecretError(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Resolve the key from the configured sources, in order
    pub async fn from_sources(sources: &[KeySource]) -> Result<Self, DeployerError> {
        for source in sources {
            match source {
                KeySource::Env(var) => {
                    if let Ok(value) = std::env::var(var) {
                        if !value.trim().is_empty() {
                            return Self::from_material(&SecretString::from(value));
                        }
                    }
                }
                KeySource::File(path) => match tokio::fs::read_to_string(path).await {
                    Ok(value) => return Self::from_material(&SecretString::from(value)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
        Err(DeployerError::SecretError(format!(
            "No encryption key configured (tried {:?})",
            sources
        )))
    }

    pub async fn from_settings(settings: &SecretSettings) -> Result<Self, DeployerError> {
        let mut sources = vec![KeySource::Env(settings.key_env.clone())];
        if let Some(file) = &settings.key_file {
            sources.push(KeySource::File(file.clone()));
        }
        Self::from_sources(&sources).await
    }

    /// Encrypt a value. Returns base64(nonce || ciphertext).
    pub fn seal(&self, plaintext: &str) -> Result<String, DeployerError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| DeployerError::SecretError(format!("Encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt a value produced by [`SecretStore::seal`]
    pub fn open(&self, sealed: &str) -> Result<SecretString, DeployerError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| DeployerError::SecretError(format!("Base64 decode failed: {}", e)))?;

        if combined.len() <= NONCE_LEN {
            return Err(DeployerError::SecretError(
                "Encrypted value too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| DeployerError::SecretError(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map(SecretString::from)
            .map_err(|e| DeployerError::SecretError(format!("UTF-8 decode failed: {}", e)))
    }

    /// Seal a whole secret map as one blob
    pub fn seal_map(&self, map: &SecretMap) -> Result<String, DeployerError> {
        let plain: BTreeMap<&str, &str> = map
            .iter()
            .map(|(k, v)| (k.as_str(), v.expose_secret()))
            .collect();
        self.seal(&serde_json::to_string(&plain)?)
    }

    /// Open a sealed secret map; an absent blob is an empty map
    pub fn open_map(&self, sealed: Option<&str>) -> Result<SecretMap, DeployerError> {
        let Some(sealed) = sealed.filter(|s| !s.is_empty()) else {
            return Ok(SecretMap::new());
        };
        let json = self.open(sealed)?;
        let plain: BTreeMap<String, String> = serde_json::from_str(json.expose_secret())?;
        Ok(plain
            .into_iter()
            .map(|(k, v)| (k, SecretString::from(v)))
            .collect())
    }
}
