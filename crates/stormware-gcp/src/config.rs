//! Google endpoints, OAuth scopes and credential file formats.

use serde::{Deserialize, Serialize};

use crate::error::{GcpError, GcpResult};

// ── Scopes ──────────────────────────────────────────────────────────────

pub mod scopes {
    pub const CLOUD_PLATFORM: &str = "https://www.googleapis.com/auth/cloud-platform";
    pub const BIGQUERY: &str = "https://www.googleapis.com/auth/bigquery";
    pub const DRIVE: &str = "https://www.googleapis.com/auth/drive";
    pub const GMAIL_READONLY: &str = "https://www.googleapis.com/auth/gmail.readonly";
    pub const SPREADSHEETS: &str = "https://www.googleapis.com/auth/spreadsheets";
    pub const OPENID: &str = "openid";
    pub const USERINFO_EMAIL: &str = "https://www.googleapis.com/auth/userinfo.email";
}

// ── Endpoints ───────────────────────────────────────────────────────────

pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";
pub const IAM_CREDENTIALS_URL: &str = "https://iamcredentials.googleapis.com";
pub const METADATA_URL: &str = "http://169.254.169.254";

/// Hosts used for authentication and API calls.
///
/// Every field can be pointed at a mock server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub token: String,
    pub auth: String,
    pub tokeninfo: String,
    pub iam_credentials: String,
    pub metadata: String,
    /// Replaces every `https://{service}.googleapis.com` API root.
    pub api: Option<String>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            token: TOKEN_URL.to_string(),
            auth: AUTH_URL.to_string(),
            tokeninfo: TOKENINFO_URL.to_string(),
            iam_credentials: IAM_CREDENTIALS_URL.to_string(),
            metadata: METADATA_URL.to_string(),
            api: None,
        }
    }
}

impl Endpoints {
    /// Route every request to `base`, e.g. a wiremock server.
    pub fn mock(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            token: format!("{}/token", base),
            auth: format!("{}/auth", base),
            tokeninfo: format!("{}/tokeninfo", base),
            iam_credentials: base.to_string(),
            metadata: base.to_string(),
            api: Some(base.to_string()),
        }
    }
}

// ── Service Account Key ─────────────────────────────────────────────────

/// Parsed service account key JSON file (downloaded from Google Cloud Console).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub private_key_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub quota_project_id: Option<String>,
}

// ── Authorized User ─────────────────────────────────────────────────────

/// `authorized_user` credentials as written by gcloud and by the OAuth cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizedUserInfo {
    /// Last access token, only present in the OAuth cache format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default, deserialize_with = "scope_list")]
    pub scopes: Vec<String>,
    /// RFC 3339 expiry of `token`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_project_id: Option<String>,
}

impl AuthorizedUserInfo {
    pub fn from_json(json: &str) -> GcpResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| GcpError::auth_error(format!("Invalid authorized user credentials: {}", e)))
    }
}

fn default_token_uri() -> String {
    TOKEN_URL.to_string()
}

/// Scopes are a JSON list in the cache and a space-separated string in
/// token responses.
fn scope_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scopes {
        List(Vec<String>),
        Joined(String),
        Null(()),
    }
    Ok(match Scopes::deserialize(deserializer)? {
        Scopes::List(list) => list,
        Scopes::Joined(joined) => split_scopes(&joined),
        Scopes::Null(()) => Vec::new(),
    })
}

pub(crate) fn split_scopes(joined: &str) -> Vec<String> {
    joined.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_endpoints_share_base() {
        let endpoints = Endpoints::mock("http://127.0.0.1:9999/");
        assert_eq!(endpoints.token, "http://127.0.0.1:9999/token");
        assert_eq!(endpoints.api.as_deref(), Some("http://127.0.0.1:9999"));
    }

    #[test]
    fn authorized_user_scopes_accept_both_forms() {
        let list = AuthorizedUserInfo::from_json(
            r#"{"client_id":"c","client_secret":"s","refresh_token":"r","scopes":["a","b"]}"#,
        )
        .unwrap();
        assert_eq!(list.scopes, vec!["a", "b"]);
        assert_eq!(list.token_uri, TOKEN_URL);

        let joined = AuthorizedUserInfo::from_json(
            r#"{"client_id":"c","client_secret":"s","scopes":"a b"}"#,
        )
        .unwrap();
        assert_eq!(joined.scopes, vec!["a", "b"]);
    }

    #[test]
    fn authorized_user_requires_client() {
        assert!(AuthorizedUserInfo::from_json(r#"{"refresh_token":"r"}"#).is_err());
    }

    #[test]
    fn service_account_defaults_token_uri() {
        let key: ServiceAccountKey = serde_json::from_str(
            r#"{"type":"service_account","private_key":"k","client_email":"sa@p.iam.gserviceaccount.com"}"#,
        )
        .unwrap();
        assert_eq!(key.token_uri, TOKEN_URL);
        assert!(key.private_key_id.is_none());
    }
}
