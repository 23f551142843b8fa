//! Google Cloud Secret Manager secret store.
//!
//! API base: `https://secretmanager.googleapis.com/v1`

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::debug;
use serde::{Deserialize, Serialize};

use stormware_core::{SecretError, SecretResult, SecretStore};

use crate::auth::GcpAuth;
use crate::client::GcpClient;
use crate::error::{GcpError, GcpResult};

const SERVICE: &str = "secretmanager";
const V1: &str = "/v1";
const BACKEND: &str = "Google Secret Manager";

// ── Types ───────────────────────────────────────────────────────────────

/// Accessed secret payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretPayload {
    /// The secret data (base64-encoded by the API).
    #[serde(default)]
    pub data: String,
    /// Decimal CRC32C of the decoded data.
    #[serde(default, rename = "dataCrc32c", skip_serializing_if = "Option::is_none")]
    pub data_crc32c: Option<String>,
}

impl SecretPayload {
    pub fn new(value: &str) -> Self {
        Self {
            data: STANDARD.encode(value.as_bytes()),
            data_crc32c: Some(crc32c::crc32c(value.as_bytes()).to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccessSecretResponse {
    #[serde(default)]
    payload: Option<SecretPayload>,
}

/// Result of verifying a payload.
#[derive(Debug, PartialEq, Eq)]
enum Decoded {
    Value(String),
    Corrupt,
}

/// A payload without `dataCrc32c` cannot be verified and counts as corrupt.
fn decode_payload(payload: &SecretPayload) -> GcpResult<Decoded> {
    let bytes = STANDARD
        .decode(payload.data.as_bytes())
        .map_err(|e| GcpError::parse(SERVICE, e))?;
    let Some(ref expected) = payload.data_crc32c else {
        return Ok(Decoded::Corrupt);
    };
    let expected: u32 = expected.parse().map_err(|e| GcpError::parse(SERVICE, e))?;
    if crc32c::crc32c(&bytes) != expected {
        return Ok(Decoded::Corrupt);
    }
    String::from_utf8(bytes)
        .map(Decoded::Value)
        .map_err(|e| GcpError::parse(SERVICE, e))
}

// ── Secret Manager ──────────────────────────────────────────────────────

/// Secrets of one project.
#[derive(Debug, Clone)]
pub struct SecretManager {
    client: GcpClient,
    project_id: String,
}

impl SecretManager {
    pub fn new(client: GcpClient, project_id: &str) -> Self {
        Self {
            client,
            project_id: project_id.to_string(),
        }
    }

    /// Secrets of the project resolved by `auth`.
    pub async fn connect(
        auth: &GcpAuth,
        organization: Option<&str>,
        project: Option<&str>,
    ) -> GcpResult<Self> {
        let client = auth.client(organization, project, &[]).await?;
        Ok(Self::new(client, &auth.project_id(organization, project)?))
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn secret_path(&self, key: &str) -> String {
        format!("{}/projects/{}/secrets/{}", V1, self.project_id, key)
    }

    /// Get the secret resource.
    pub async fn get_secret(&self, key: &str) -> GcpResult<serde_json::Value> {
        self.client.get(SERVICE, &self.secret_path(key), &[]).await
    }

    /// Create a secret with automatic replication and no versions.
    pub async fn create_secret(&self, key: &str) -> GcpResult<serde_json::Value> {
        debug!("Creating secret \"{}\" in project \"{}\"", key, self.project_id);
        let path = format!("{}/projects/{}/secrets", V1, self.project_id);
        let body = serde_json::json!({
            "replication": {
                "automatic": {}
            }
        });
        self.client
            .post(SERVICE, &path, &[("secretId", key)], &body)
            .await
    }

    /// Add a new version carrying `value` and its checksum.
    pub async fn add_secret_version(&self, key: &str, value: &str) -> GcpResult<serde_json::Value> {
        let path = format!("{}:addVersion", self.secret_path(key));
        let body = serde_json::json!({ "payload": SecretPayload::new(value) });
        self.client.post(SERVICE, &path, &[], &body).await
    }

    /// Payload of the latest version.
    pub async fn access_latest(&self, key: &str) -> GcpResult<SecretPayload> {
        let path = format!("{}/versions/latest:access", self.secret_path(key));
        let resp: AccessSecretResponse = self.client.get(SERVICE, &path, &[]).await?;
        resp.payload
            .ok_or_else(|| GcpError::parse(SERVICE, format!("secret \"{}\" has no payload", key)))
    }

    pub async fn delete_secret(&self, key: &str) -> GcpResult<()> {
        self.client.delete(SERVICE, &self.secret_path(key), &[]).await
    }
}

#[async_trait]
impl SecretStore for SecretManager {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn get(&self, key: &str) -> SecretResult<String> {
        debug!("Loading secret \"{}\"", key);
        let payload = self
            .access_latest(key)
            .await
            .map_err(|e| e.into_secret_error(key))?;
        match decode_payload(&payload).map_err(|e| e.into_secret_error(key))? {
            Decoded::Value(value) => Ok(value),
            Decoded::Corrupt => Err(SecretError::DataCorruption(key.to_string())),
        }
    }

    async fn exists(&self, key: &str) -> SecretResult<bool> {
        match self.get_secret(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into_secret_error(key)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> SecretResult<()> {
        if !self.exists(key).await? {
            self.create_secret(key)
                .await
                .map_err(|e| e.into_secret_error(key))?;
        }
        debug!("Storing secret \"{}\"", key);
        self.add_secret_version(key, value)
            .await
            .map_err(|e| e.into_secret_error(key))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> SecretResult<()> {
        debug!("Deleting secret \"{}\"", key);
        self.delete_secret(key)
            .await
            .map_err(|e| e.into_secret_error(key))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
