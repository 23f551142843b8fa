//! Access-token sources for Google APIs.
//!
//! A [`Credentials`] value wraps one token source and caches the last token
//! it minted:
//!
//! 1. `AuthorizedUser`: refresh-token grant at the token URI
//! 2. `ServiceAccount`: JWT bearer grant signed with the account's RSA key
//! 3. `Impersonated`: IAM Credentials `generateAccessToken` on behalf of a
//!    target service account, authenticated by another `Credentials`
//! 4. `Metadata`: the GCE metadata server
//! 5. `AccessToken`: a static bearer token

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::{scopes, split_scopes, AuthorizedUserInfo, ServiceAccountKey};
use crate::error::{GcpError, GcpResult};

const USER_AGENT: &str = concat!("stormware/", env!("CARGO_PKG_VERSION"), " gcp-auth");

/// Lifetime requested for JWT assertions and impersonated tokens.
const TOKEN_LIFETIME_SECS: i64 = 3600;

/// JWT claims for Google OAuth2.
#[derive(Debug, Serialize)]
struct JwtClaims {
    /// Issuer, the service account email.
    iss: String,
    /// Requested scopes (space-separated).
    scope: String,
    /// Audience, the token endpoint.
    aud: String,
    exp: i64,
    iat: i64,
}

/// An OAuth2 access token with metadata.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    /// Unix timestamp in seconds, `None` for tokens without a known expiry.
    pub expires_at: Option<i64>,
}

impl AccessToken {
    /// Check if the token is expired (with 60 s buffer).
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now().timestamp() >= expires_at - 60,
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
enum Kind {
    AuthorizedUser(AuthorizedUserInfo),
    ServiceAccount(ServiceAccountKey),
    Impersonated {
        source: Arc<Credentials>,
        target: String,
        endpoint: String,
    },
    Metadata {
        endpoint: String,
    },
    AccessToken,
}

/// A token source plus its cached access token.
#[derive(Debug)]
pub struct Credentials {
    kind: Kind,
    scopes: Vec<String>,
    quota_project_id: Option<String>,
    http: Client,
    token: Mutex<Option<AccessToken>>,
}

pub(crate) fn http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(15))
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

impl Credentials {
    fn with_kind(kind: Kind, scopes: Vec<String>, token: Option<AccessToken>) -> Self {
        Self {
            kind,
            scopes,
            quota_project_id: None,
            http: http_client(),
            token: Mutex::new(token),
        }
    }

    // ── Construction ────────────────────────────────────────────────────

    /// Load a credentials file, dispatching on its `type`.
    pub fn from_file(path: &Path) -> GcpResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| GcpError::io(path, e))?;
        let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            GcpError::auth_error(format!("Invalid credentials file \"{}\": {}", path.display(), e))
        })?;

        debug!("Loading credentials from \"{}\"", path.display());
        match value.get("type").and_then(|t| t.as_str()) {
            Some("service_account") => {
                let key: ServiceAccountKey = serde_json::from_value(value).map_err(|e| {
                    GcpError::auth_error(format!("Invalid service account key: {}", e))
                })?;
                Ok(Self::service_account(key))
            }
            Some("authorized_user") | None => Self::from_authorized_user_info(&text),
            Some(other) => Err(GcpError::auth_error(format!(
                "Unsupported credentials type \"{}\" in \"{}\"",
                other,
                path.display()
            ))),
        }
    }

    /// Authorized-user credentials from their JSON form, seeding the cached
    /// token when `token` and `expiry` are present.
    pub fn from_authorized_user_info(json: &str) -> GcpResult<Self> {
        let info = AuthorizedUserInfo::from_json(json)?;
        Ok(Self::authorized_user(info))
    }

    pub fn authorized_user(info: AuthorizedUserInfo) -> Self {
        let token = info.token.clone().map(|token| AccessToken {
            token,
            expires_at: info
                .expiry
                .as_deref()
                .and_then(|e| DateTime::parse_from_rfc3339(e).ok())
                .map(|e| e.timestamp()),
        });
        let scopes = info.scopes.clone();
        let quota_project_id = info.quota_project_id.clone();
        let mut credentials = Self::with_kind(Kind::AuthorizedUser(info), scopes, token);
        credentials.quota_project_id = quota_project_id;
        credentials
    }

    pub fn service_account(key: ServiceAccountKey) -> Self {
        let quota_project_id = key.quota_project_id.clone();
        let mut credentials = Self::with_kind(
            Kind::ServiceAccount(key),
            vec![scopes::CLOUD_PLATFORM.to_string()],
            None,
        );
        credentials.quota_project_id = quota_project_id;
        credentials
    }

    /// Tokens for `target` minted with the identity of `source`.
    pub fn impersonated(
        source: Arc<Credentials>,
        target: &str,
        scopes: Vec<String>,
        endpoint: &str,
    ) -> Self {
        let quota_project_id = source.quota_project_id.clone();
        let mut credentials = Self::with_kind(
            Kind::Impersonated {
                source,
                target: target.to_string(),
                endpoint: endpoint.trim_end_matches('/').to_string(),
            },
            scopes,
            None,
        );
        credentials.quota_project_id = quota_project_id;
        credentials
    }

    pub fn metadata(endpoint: &str) -> Self {
        Self::with_kind(
            Kind::Metadata {
                endpoint: endpoint.trim_end_matches('/').to_string(),
            },
            vec![scopes::CLOUD_PLATFORM.to_string()],
            None,
        )
    }

    /// A fixed bearer token that is never refreshed.
    pub fn from_access_token(token: &str) -> Self {
        Self::with_kind(
            Kind::AccessToken,
            Vec::new(),
            Some(AccessToken {
                token: token.to_string(),
                expires_at: None,
            }),
        )
    }

    pub fn with_quota_project(mut self, quota_project_id: &str) -> Self {
        self.quota_project_id = Some(quota_project_id.to_string());
        self
    }

    /// Same token source, minting tokens for `scopes`.
    ///
    /// `None` when the source cannot choose its scopes.
    pub fn with_scopes(&self, scopes: &[String]) -> Option<Self> {
        if !self.can_rescope() {
            return None;
        }
        let mut credentials = Self::with_kind(self.kind.clone(), scopes.to_vec(), None);
        credentials.quota_project_id = self.quota_project_id.clone();
        Some(credentials)
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            Kind::AuthorizedUser(_) => "authorized user",
            Kind::ServiceAccount(_) => "service account",
            Kind::Impersonated { .. } => "impersonated",
            Kind::Metadata { .. } => "metadata server",
            Kind::AccessToken => "access token",
        }
    }

    /// Whether arbitrary scopes can be requested from this source.
    pub fn can_rescope(&self) -> bool {
        matches!(self.kind, Kind::ServiceAccount(_) | Kind::Impersonated { .. })
    }

    /// Whether every scope in `requested` has been granted.
    pub fn has_scopes(&self, requested: &[String]) -> bool {
        requested.iter().all(|s| self.scopes.contains(s))
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn quota_project_id(&self) -> Option<&str> {
        self.quota_project_id.as_deref()
    }

    /// The service account whose identity the tokens carry, if any.
    pub fn service_account_email(&self) -> Option<&str> {
        match &self.kind {
            Kind::ServiceAccount(key) => Some(&key.client_email),
            Kind::Impersonated { target, .. } => Some(target),
            _ => None,
        }
    }

    // ── Tokens ──────────────────────────────────────────────────────────

    /// Get a valid access token, refreshing if needed.
    pub async fn access_token(&self) -> GcpResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(ref token) = *cached {
            if !token.is_expired() {
                return Ok(token.token.clone());
            }
        }
        let token = self.fetch_token().await?;
        let result = token.token.clone();
        *cached = Some(token);
        Ok(result)
    }

    /// Force refresh the token.
    pub async fn refresh(&self) -> GcpResult<String> {
        let mut cached = self.token.lock().await;
        if matches!(self.kind, Kind::AccessToken) {
            return cached
                .as_ref()
                .map(|t| t.token.clone())
                .ok_or_else(|| GcpError::auth_error("No access token"));
        }
        let token = self.fetch_token().await?;
        let result = token.token.clone();
        *cached = Some(token);
        Ok(result)
    }

    async fn fetch_token(&self) -> GcpResult<AccessToken> {
        debug!("Fetching {} access token", self.kind_name());
        match &self.kind {
            Kind::AuthorizedUser(info) => self.fetch_refresh_grant(info).await,
            Kind::ServiceAccount(key) => self.fetch_jwt_grant(key).await,
            Kind::Impersonated {
                source,
                target,
                endpoint,
            } => self.fetch_impersonated(source, target, endpoint).await,
            Kind::Metadata { endpoint } => self.fetch_metadata(endpoint).await,
            Kind::AccessToken => Err(GcpError::auth_error("Static access token has expired")),
        }
    }

    async fn fetch_refresh_grant(&self, info: &AuthorizedUserInfo) -> GcpResult<AccessToken> {
        let refresh_token = info.refresh_token.as_deref().ok_or_else(|| {
            GcpError::auth_error("Authorized user credentials have no refresh token")
        })?;
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", info.client_id.as_str()),
            ("client_secret", info.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];
        let response = self.http.post(&info.token_uri).form(&form).send().await?;
        token_response(response).await
    }

    /// Exchange a JWT assertion for an access token.
    async fn fetch_jwt_grant(&self, key: &ServiceAccountKey) -> GcpResult<AccessToken> {
        let now = Utc::now().timestamp();
        let scope = if self.scopes.is_empty() {
            scopes::CLOUD_PLATFORM.to_string()
        } else {
            self.scopes.join(" ")
        };
        let claims = JwtClaims {
            iss: key.client_email.clone(),
            scope,
            aud: key.token_uri.clone(),
            exp: now + TOKEN_LIFETIME_SECS,
            iat: now,
        };
        let header = Header {
            alg: Algorithm::RS256,
            kid: key.private_key_id.clone(),
            ..Default::default()
        };

        // Normalise PEM line breaks.
        let pem = key.private_key.replace("\\n", "\n");
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| GcpError::auth_error(format!("Failed to load private key: {}", e)))?;
        let jwt = encode(&header, &claims, &encoding_key)
            .map_err(|e| GcpError::auth_error(format!("Failed to encode JWT: {}", e)))?;

        let form = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", jwt.as_str()),
        ];
        let response = self.http.post(&key.token_uri).form(&form).send().await?;
        token_response(response).await
    }

    async fn fetch_impersonated(
        &self,
        source: &Credentials,
        target: &str,
        endpoint: &str,
    ) -> GcpResult<AccessToken> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct GenerateAccessTokenResponse {
            access_token: String,
            expire_time: Option<String>,
        }

        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{}:generateAccessToken",
            endpoint, target
        );
        let scope = if self.scopes.is_empty() {
            vec![scopes::CLOUD_PLATFORM.to_string()]
        } else {
            self.scopes.clone()
        };
        let body = serde_json::json!({
            "scope": scope,
            "lifetime": format!("{}s", TOKEN_LIFETIME_SECS),
        });
        let response = self
            .http
            .post(&url)
            .bearer_auth(Box::pin(source.access_token()).await?)
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        if !(200..300).contains(&status) {
            return Err(GcpError::from_api_response("iamcredentials", status, &text));
        }
        let parsed: GenerateAccessTokenResponse =
            serde_json::from_str(&text).map_err(|e| GcpError::parse("iamcredentials", e))?;
        Ok(AccessToken {
            token: parsed.access_token,
            expires_at: parsed
                .expire_time
                .as_deref()
                .and_then(|e| DateTime::parse_from_rfc3339(e).ok())
                .map(|e| e.timestamp()),
        })
    }

    async fn fetch_metadata(&self, endpoint: &str) -> GcpResult<AccessToken> {
        let url = format!(
            "{}/computeMetadata/v1/instance/service-accounts/default/token",
            endpoint
        );
        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        token_response(response).await
    }

    /// The authorized-user persistence format, including the current token.
    pub async fn to_json(&self) -> GcpResult<String> {
        let info = match &self.kind {
            Kind::AuthorizedUser(info) => info,
            _ => {
                return Err(GcpError::invalid(
                    "auth",
                    format!("Cannot serialize {} credentials", self.kind_name()),
                ))
            }
        };
        let cached = self.token.lock().await.clone();
        let persisted = AuthorizedUserInfo {
            token: cached.as_ref().map(|t| t.token.clone()),
            expiry: cached
                .and_then(|t| t.expires_at)
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
                .map(|e| e.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            scopes: self.scopes.clone(),
            quota_project_id: None,
            ..info.clone()
        };
        serde_json::to_string(&persisted).map_err(|e| GcpError::parse("auth", e))
    }
}

/// Parse an OAuth token endpoint response.
async fn token_response(response: reqwest::Response) -> GcpResult<AccessToken> {
    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: String,
        expires_in: Option<i64>,
    }

    let status = response.status().as_u16();
    let text = response.text().await?;
    if !(200..300).contains(&status) {
        return Err(GcpError::from_api_response("auth", status, &text));
    }
    let parsed: TokenResponse =
        serde_json::from_str(&text).map_err(|e| GcpError::parse("auth", e))?;
    Ok(AccessToken {
        token: parsed.access_token,
        expires_at: Some(Utc::now().timestamp() + parsed.expires_in.unwrap_or(TOKEN_LIFETIME_SECS)),
    })
}

/// Scopes granted in a token response, when the endpoint reports them.
pub(crate) fn granted_scopes(scope: Option<&str>, requested: &[String]) -> Vec<String> {
    match scope {
        Some(scope) if !scope.trim().is_empty() => split_scopes(scope),
        _ => requested.to_vec(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
