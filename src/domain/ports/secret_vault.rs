//! Secret vault port.
//!
//! Secrets come either from an external vault behind this port or from the
//! in-process encrypted store in `security::secrets`.

use anyhow::Result;
use async_trait::async_trait;

/// Decrypted secret material. Holders must not log or persist it.
#[derive(Clone)]
pub struct SecretMaterial {
    pub name: String,
    pub value: Vec<u8>,
}

impl std::fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Value is intentionally not printed.
        f.debug_struct("SecretMaterial")
            .field("name", &self.name)
            .field("len", &self.value.len())
            .finish()
    }
}

/// Port to an external secret vault.
#[async_trait]
pub trait SecretVault: Send + Sync {
    /// Fetch and decrypt a secret by name.
    async fn fetch(&self, name: &str) -> Result<SecretMaterial>;

    /// Whether a secret exists without fetching its material.
    async fn exists(&self, name: &str) -> Result<bool>;
}
