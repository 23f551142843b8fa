//! Key/value secret storage.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{SecretError, SecretResult};

/// A managed secrets service keyed by secret name.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Short backend name used in log and error messages.
    fn backend(&self) -> &str;

    /// Latest value of `key`.
    async fn get(&self, key: &str) -> SecretResult<String>;

    /// Whether the secret resource exists, whether or not it holds a value.
    async fn exists(&self, key: &str) -> SecretResult<bool>;

    /// Store a new value, creating the secret when needed.
    async fn set(&self, key: &str, value: &str) -> SecretResult<()>;

    async fn delete(&self, key: &str) -> SecretResult<()>;
}

/// In-process store, mostly useful for tests and local tooling.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<String, Option<String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a secret value.
    pub fn with_secret(mut self, key: &str, value: &str) -> Self {
        self.entries
            .get_mut()
            .insert(key.to_string(), Some(value.to_string()));
        self
    }

    /// Create a secret with no value, like a managed secret without versions.
    pub async fn create_empty(&self, key: &str) {
        self.entries
            .write()
            .await
            .entry(key.to_string())
            .or_insert(None);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> SecretResult<String> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .flatten()
            .ok_or_else(|| SecretError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> SecretResult<bool> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn set(&self, key: &str, value: &str) -> SecretResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), Some(value.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> SecretResult<()> {
        match self.entries.write().await.remove(key) {
            Some(_) => Ok(()),
            None => Err(SecretError::NotFound(key.to_string())),
        }
    }
}
