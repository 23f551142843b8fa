//! Interactive OAuth2 authorization-code flow for installed applications.
//!
//! The browser redirect lands on `yup-oauth2`'s local HTTP listener. The
//! resulting tokens are captured through its `TokenStorage` seam so that the
//! caller can persist them in its own authorized-user format.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use yup_oauth2::authenticator_delegate::InstalledFlowDelegate;
use yup_oauth2::storage::{TokenInfo, TokenStorage};
use yup_oauth2::{ApplicationSecret, InstalledFlowAuthenticator, InstalledFlowReturnMethod};

use crate::config::Endpoints;
use crate::error::{GcpError, GcpResult};

/// OAuth client ID and secret of an installed or web application.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
}

impl ClientSecrets {
    /// Parse the client secrets JSON downloaded from the Cloud Console.
    ///
    /// The fields are either top level or nested under `installed` / `web`.
    pub fn from_json(json: &str) -> GcpResult<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| GcpError::auth_error(format!("Invalid OAuth client secrets: {}", e)))?;
        let inner = value
            .get("installed")
            .or_else(|| value.get("web"))
            .cloned()
            .unwrap_or(value);
        serde_json::from_value(inner)
            .map_err(|e| GcpError::auth_error(format!("Invalid OAuth client secrets: {}", e)))
    }

    /// Installed-application secret aimed at `endpoints`.
    pub fn application_secret(&self, endpoints: &Endpoints) -> ApplicationSecret {
        ApplicationSecret {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            auth_uri: endpoints.auth.clone(),
            token_uri: endpoints.token.clone(),
            redirect_uris: vec!["http://localhost".to_string()],
            ..ApplicationSecret::default()
        }
    }
}

/// Tokens returned by the code exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct UserTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl UserTokens {
    fn from_token_info(token: TokenInfo) -> GcpResult<Self> {
        let access_token = token
            .access_token
            .ok_or_else(|| GcpError::auth_error("The authorization response carries no access token"))?;
        Ok(Self {
            access_token,
            refresh_token: token.refresh_token,
            id_token: token.id_token,
            expires_in: token
                .expires_at
                .map(|at| at.unix_timestamp() - Utc::now().timestamp()),
            scope: None,
        })
    }
}

/// Obtains user tokens for a set of scopes.
#[async_trait]
pub trait AuthorizationFlow: Send + Sync {
    async fn authorize(
        &self,
        secrets: &ClientSecrets,
        scopes: &[String],
        endpoints: &Endpoints,
    ) -> GcpResult<UserTokens>;
}

/// Authorization-code flow with a redirect to a local listener.
#[derive(Debug, Clone, Default)]
pub struct LoopbackFlow;

#[async_trait]
impl AuthorizationFlow for LoopbackFlow {
    async fn authorize(
        &self,
        secrets: &ClientSecrets,
        scopes: &[String],
        endpoints: &Endpoints,
    ) -> GcpResult<UserTokens> {
        if scopes.is_empty() {
            return Err(GcpError::invalid("auth", "At least one scope is required"));
        }

        let captured = CapturedTokens::default();
        let authenticator = InstalledFlowAuthenticator::builder(
            secrets.application_secret(endpoints),
            InstalledFlowReturnMethod::HTTPRedirect,
        )
        .flow_delegate(Box::new(StderrPrompt))
        .with_storage(Box::new(captured.clone()))
        .build()
        .await
        .map_err(|e| GcpError::auth_error(format!("Cannot start the OAuth flow: {}", e)))?;

        info!("Waiting for browser authorization");
        authenticator
            .token(scopes)
            .await
            .map_err(|e| GcpError::auth_error(format!("Authorization failed: {}", e)))?;

        let token = captured
            .take()
            .ok_or_else(|| GcpError::auth_error("The OAuth flow returned no tokens"))?;
        UserTokens::from_token_info(token)
    }
}

/// Shows the authorization URL on stderr so stdout stays machine-readable.
struct StderrPrompt;

impl InstalledFlowDelegate for StderrPrompt {
    fn present_user_url<'a>(
        &'a self,
        url: &'a str,
        _need_code: bool,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>> {
        Box::pin(async move {
            eprintln!("Please visit this URL to authorize this application: {}", url);
            Ok(String::new())
        })
    }
}

/// Token storage that keeps the last token handed over by the flow.
#[derive(Debug, Clone, Default)]
struct CapturedTokens(Arc<Mutex<Option<TokenInfo>>>);

impl CapturedTokens {
    fn take(&self) -> Option<TokenInfo> {
        self.0.lock().ok().and_then(|mut token| token.take())
    }
}

#[async_trait]
impl TokenStorage for CapturedTokens {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> anyhow::Result<()> {
        debug!("Received tokens from the authorization flow");
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(token);
        }
        Ok(())
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        // The caller owns the token cache.
        None
    }
}

/// Email address carried by an ID token, as reported by `tokeninfo`.
pub async fn verify_id_token_email(
    http: &Client,
    tokeninfo_endpoint: &str,
    id_token: &str,
) -> GcpResult<String> {
    #[derive(Deserialize)]
    struct TokenInfo {
        email: Option<String>,
    }

    let response = http
        .get(tokeninfo_endpoint)
        .query(&[("id_token", id_token)])
        .send()
        .await?;
    let status = response.status().as_u16();
    let text = response.text().await?;
    if !(200..300).contains(&status) {
        return Err(GcpError::from_api_response("auth", status, &text));
    }
    let info: TokenInfo = serde_json::from_str(&text).map_err(|e| GcpError::parse("auth", e))?;
    info.email
        .ok_or_else(|| GcpError::auth_error("ID token carries no email address"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
