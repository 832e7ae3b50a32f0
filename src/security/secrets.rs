//! Secret management and injection.
//!
//! Secrets live in an in-process AES-256-GCM store (key derived from the
//! master passphrase with PBKDF2) or behind an external vault port. On job
//! start each declared secret is decrypted and injected by env, file, or
//! tmpfs mount, and the job receives a short-lived access token that is
//! revoked at context close.

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::{InjectedSecret, SecretInjectionMode, SecretNeed};
use crate::domain::ports::{ContainerSpec, SecretVault};

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_SIZE: usize = 32;

/// Lifetime of job access tokens.
const TOKEN_TTL_MINUTES: i64 = 60;

#[derive(Clone)]
struct StoredSecret {
    /// `salt || nonce || ciphertext`, base64.
    envelope: String,
}

#[derive(Clone)]
struct IssuedToken {
    job_id: Uuid,
    expires_at: DateTime<Utc>,
    revoked: bool,
}

struct SecretState {
    secrets: HashMap<String, StoredSecret>,
    tokens: HashMap<String, IssuedToken>,
}

/// Encrypted secret store plus injection plumbing.
pub struct SecretManager {
    enabled: bool,
    passphrase: String,
    vault: Option<Arc<dyn SecretVault>>,
    state: Mutex<SecretState>,
}

impl SecretManager {
    pub fn new(enabled: bool, passphrase: impl Into<String>) -> Self {
        Self {
            enabled,
            passphrase: passphrase.into(),
            vault: None,
            state: Mutex::new(SecretState {
                secrets: HashMap::new(),
                tokens: HashMap::new(),
            }),
        }
    }

    /// Route fetches through an external vault instead of the local store.
    pub fn with_vault(mut self, vault: Arc<dyn SecretVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
        pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS)
    }

    fn encrypt(&self, plaintext: &[u8]) -> OrchestratorResult<String> {
        let salt: [u8; SALT_SIZE] = rand_bytes();
        let key = Self::derive_key(&self.passphrase, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| OrchestratorError::InternalError(e.to_string()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| OrchestratorError::InternalError(e.to_string()))?;

        let mut envelope = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
        envelope.extend_from_slice(&salt);
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(envelope))
    }

    fn decrypt(&self, envelope: &str) -> OrchestratorResult<Vec<u8>> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(envelope)
            .map_err(|e| OrchestratorError::SecretUnavailable(e.to_string()))?;
        if raw.len() < SALT_SIZE + NONCE_SIZE {
            return Err(OrchestratorError::SecretUnavailable(
                "envelope too short".to_string(),
            ));
        }
        let (salt, rest) = raw.split_at(SALT_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        let key = Self::derive_key(&self.passphrase, salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| OrchestratorError::InternalError(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| OrchestratorError::SecretUnavailable("decryption failed".to_string()))
    }

    /// Store a secret encrypted at rest.
    pub async fn store(&self, name: impl Into<String>, value: &[u8]) -> OrchestratorResult<()> {
        let envelope = self.encrypt(value)?;
        self.state
            .lock()
            .await
            .secrets
            .insert(name.into(), StoredSecret { envelope });
        Ok(())
    }

    async fn fetch(&self, name: &str) -> OrchestratorResult<Vec<u8>> {
        if let Some(vault) = &self.vault {
            let material = vault
                .fetch(name)
                .await
                .map_err(|e| OrchestratorError::SecretUnavailable(e.to_string()))?;
            return Ok(material.value);
        }
        let state = self.state.lock().await;
        let stored = state
            .secrets
            .get(name)
            .ok_or_else(|| OrchestratorError::SecretUnavailable(name.to_string()))?;
        self.decrypt(&stored.envelope)
    }

    /// Decrypt and inject every declared secret into the container spec.
    /// Returns the injection records (with access tokens) for the security
    /// context.
    pub async fn inject(
        &self,
        job_id: Uuid,
        needs: &[SecretNeed],
        spec: &mut ContainerSpec,
    ) -> OrchestratorResult<Vec<InjectedSecret>> {
        if !self.enabled || needs.is_empty() {
            return Ok(Vec::new());
        }
        let mut injected = Vec::with_capacity(needs.len());
        for need in needs {
            let value = self.fetch(&need.name).await?;
            match need.mode {
                SecretInjectionMode::Env => {
                    let var = need
                        .target
                        .clone()
                        .unwrap_or_else(|| need.name.to_uppercase().replace('-', "_"));
                    spec.env.insert(
                        var,
                        String::from_utf8_lossy(&value).into_owned(),
                    );
                }
                SecretInjectionMode::File => {
                    // The engine materialises labelled secret files at
                    // start; the value itself never lands in the spec.
                    let path = need
                        .target
                        .clone()
                        .unwrap_or_else(|| format!("/run/secrets/{}", need.name));
                    spec.labels
                        .insert(format!("runnerhub.secret-file.{}", need.name), path);
                }
                SecretInjectionMode::Memory => {
                    spec.tmpfs.push(format!("/run/secrets/{}", need.name));
                }
            }

            let token = self.issue_token(job_id).await;
            injected.push(InjectedSecret {
                name: need.name.clone(),
                access_token: token,
                expires_at: Utc::now() + Duration::minutes(TOKEN_TTL_MINUTES),
            });
            debug!(job_id = %job_id, secret = %need.name, mode = ?need.mode, "secret injected");
        }
        Ok(injected)
    }

    async fn issue_token(&self, job_id: Uuid) -> String {
        let token_bytes: [u8; 24] = rand_bytes();
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(token_bytes);
        self.state.lock().await.tokens.insert(
            token.clone(),
            IssuedToken {
                job_id,
                expires_at: Utc::now() + Duration::minutes(TOKEN_TTL_MINUTES),
                revoked: false,
            },
        );
        token
    }

    /// Whether a token currently grants secret re-reads for its job.
    pub async fn token_valid(&self, token: &str) -> bool {
        self.state
            .lock()
            .await
            .tokens
            .get(token)
            .is_some_and(|t| !t.revoked && t.expires_at > Utc::now())
    }

    /// Revoke every token issued to a job. Called at context close.
    pub async fn revoke_job_tokens(&self, job_id: Uuid) -> usize {
        let mut state = self.state.lock().await;
        let mut revoked = 0;
        for token in state.tokens.values_mut() {
            if token.job_id == job_id && !token.revoked {
                token.revoked = true;
                revoked += 1;
            }
        }
        if revoked > 0 {
            info!(job_id = %job_id, count = revoked, "secret access tokens revoked");
        }
        revoked
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Random bytes from the AEAD crate's RNG.
fn rand_bytes<const N: usize>() -> [u8; N] {
    use aes_gcm::aead::rand_core::RngCore;
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SecretManager {
        SecretManager::new(true, "correct horse battery staple")
    }

    fn need(name: &str, mode: SecretInjectionMode) -> SecretNeed {
        SecretNeed {
            name: name.to_string(),
            mode,
            target: None,
        }
    }

    #[tokio::test]
    async fn test_store_and_fetch_round_trip() {
        let secrets = manager();
        secrets.store("npm-token", b"s3cr3t").await.unwrap();
        let value = secrets.fetch("npm-token").await.unwrap();
        assert_eq!(value, b"s3cr3t");
    }

    #[tokio::test]
    async fn test_missing_secret_unavailable() {
        let secrets = manager();
        let err = secrets.fetch("ghost").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::SecretUnavailable(_)));
    }

    #[tokio::test]
    async fn test_wrong_passphrase_fails_decrypt() {
        let secrets = manager();
        secrets.store("token", b"value").await.unwrap();
        let envelope = secrets
            .state
            .lock()
            .await
            .secrets
            .get("token")
            .unwrap()
            .envelope
            .clone();

        let other = SecretManager::new(true, "wrong passphrase");
        assert!(other.decrypt(&envelope).is_err());
    }

    #[tokio::test]
    async fn test_env_injection() {
        let secrets = manager();
        secrets.store("npm-token", b"abc123").await.unwrap();

        let mut spec = ContainerSpec::default();
        let job_id = Uuid::new_v4();
        let injected = secrets
            .inject(job_id, &[need("npm-token", SecretInjectionMode::Env)], &mut spec)
            .await
            .unwrap();

        assert_eq!(spec.env.get("NPM_TOKEN").map(String::as_str), Some("abc123"));
        assert_eq!(injected.len(), 1);
        assert!(secrets.token_valid(&injected[0].access_token).await);
    }

    #[tokio::test]
    async fn test_file_and_memory_injection_never_put_value_in_spec() {
        let secrets = manager();
        secrets.store("deploy-key", b"PRIVATE").await.unwrap();

        let mut spec = ContainerSpec::default();
        secrets
            .inject(
                Uuid::new_v4(),
                &[
                    need("deploy-key", SecretInjectionMode::File),
                    need("deploy-key", SecretInjectionMode::Memory),
                ],
                &mut spec,
            )
            .await
            .unwrap();

        let rendered = serde_json::to_string(&spec).unwrap();
        assert!(!rendered.contains("PRIVATE"));
        assert!(spec
            .labels
            .contains_key("runnerhub.secret-file.deploy-key"));
        assert_eq!(spec.tmpfs, vec!["/run/secrets/deploy-key".to_string()]);
    }

    #[tokio::test]
    async fn test_revoke_job_tokens() {
        let secrets = manager();
        secrets.store("token", b"v").await.unwrap();

        let job_id = Uuid::new_v4();
        let mut spec = ContainerSpec::default();
        let injected = secrets
            .inject(job_id, &[need("token", SecretInjectionMode::Env)], &mut spec)
            .await
            .unwrap();
        let token = injected[0].access_token.clone();
        assert!(secrets.token_valid(&token).await);

        assert_eq!(secrets.revoke_job_tokens(job_id).await, 1);
        assert!(!secrets.token_valid(&token).await);

        // Revoking again finds nothing outstanding.
        assert_eq!(secrets.revoke_job_tokens(job_id).await, 0);
    }

    #[tokio::test]
    async fn test_disabled_injects_nothing() {
        let secrets = SecretManager::new(false, "pass");
        let mut spec = ContainerSpec::default();
        let injected = secrets
            .inject(
                Uuid::new_v4(),
                &[need("anything", SecretInjectionMode::Env)],
                &mut spec,
            )
            .await
            .unwrap();
        assert!(injected.is_empty());
        assert!(spec.env.is_empty());
    }

    #[tokio::test]
    async fn test_missing_secret_blocks_injection() {
        let secrets = manager();
        let mut spec = ContainerSpec::default();
        let err = secrets
            .inject(
                Uuid::new_v4(),
                &[need("ghost", SecretInjectionMode::Env)],
                &mut spec,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::SecretUnavailable(_)));
    }
}
