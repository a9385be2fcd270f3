//! Signing key resolution
//!
//! Keys are looked up per actor at publish time through an injected
//! `KeyProvider`. Nothing is cached across actors or publishes.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};

use crate::error::AppError;

/// An actor's private RSA key
///
/// The key material is only reachable from inside the crate; callers hand
/// it to a `Signer` and never see the private half again.
pub struct SigningKey {
    private_key: RsaPrivateKey,
}

impl SigningKey {
    /// Parse a PKCS#8 PEM private key.
    ///
    /// A base64-wrapped PEM (as stored in env-style key files) is accepted too.
    pub fn from_pem(pem: &str) -> Result<Self, AppError> {
        let trimmed = pem.trim();
        let decoded;
        let pem = if trimmed.starts_with("-----BEGIN") {
            trimmed
        } else {
            let bytes = BASE64
                .decode(trimmed)
                .map_err(|e| AppError::Configuration(format!("Invalid private key: {}", e)))?;
            decoded = String::from_utf8(bytes)
                .map_err(|e| AppError::Configuration(format!("Invalid private key: {}", e)))?;
            decoded.as_str()
        };

        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| AppError::Configuration(format!("Invalid private key: {}", e)))?;
        Ok(Self { private_key })
    }

    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        Self { private_key }
    }

    /// PEM-encoded public half, as published in the actor document
    pub fn public_key_pem(&self) -> Result<String, AppError> {
        self.private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(e.into()))
    }

    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey").finish_non_exhaustive()
    }
}

/// External keystore
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Resolve the signing key for a local actor.
    ///
    /// # Errors
    /// `Configuration` when the actor has no usable key.
    async fn resolve_signing_key(&self, actor_id: &str) -> Result<SigningKey, AppError>;
}

/// Reads `<directory>/<actor_id>.pem` on every lookup
#[derive(Debug, Clone)]
pub struct PemDirectoryKeyProvider {
    directory: PathBuf,
}

impl PemDirectoryKeyProvider {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl KeyProvider for PemDirectoryKeyProvider {
    async fn resolve_signing_key(&self, actor_id: &str) -> Result<SigningKey, AppError> {
        if actor_id.is_empty()
            || actor_id.contains(['/', '\\'])
            || actor_id.starts_with('.')
        {
            return Err(AppError::Configuration(format!(
                "Invalid actor id for key lookup: {:?}",
                actor_id
            )));
        }

        let path = self.directory.join(format!("{}.pem", actor_id));
        let pem = tokio::fs::read_to_string(&path).await.map_err(|e| {
            AppError::Configuration(format!(
                "No signing key for {} at {}: {}",
                actor_id,
                path.display(),
                e
            ))
        })?;

        tracing::debug!(actor = actor_id, path = %path.display(), "Loaded signing key");
        SigningKey::from_pem(&pem)
    }
}

/// Keys held as PEM strings, keyed by actor id
#[derive(Debug, Clone, Default)]
pub struct InMemoryKeyProvider {
    keys: HashMap<String, String>,
}

impl InMemoryKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, actor_id: impl Into<String>, pem: impl Into<String>) -> Self {
        self.keys.insert(actor_id.into(), pem.into());
        self
    }
}

#[async_trait]
impl KeyProvider for InMemoryKeyProvider {
    async fn resolve_signing_key(&self, actor_id: &str) -> Result<SigningKey, AppError> {
        let pem = self
            .keys
            .get(actor_id)
            .ok_or_else(|| AppError::Configuration(format!("No signing key for {}", actor_id)))?;
        SigningKey::from_pem(pem)
    }
}

#[cfg(test)]
pub(crate) fn generate_test_pem() -> String {
    use rsa::pkcs8::EncodePrivateKey;

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
    private_key
        .to_pkcs8_pem(LineEnding::LF)
        .expect("private key pem")
        .to_string()
}
