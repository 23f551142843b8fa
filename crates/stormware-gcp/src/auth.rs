//! Credential resolution for an organization and project.
//!
//! [`GcpAuth::credentials`] picks a token source in this order:
//!
//! 1. Organization credentials file
//!    `$XDG_CONFIG_HOME/gcloud/credentials/{organization_id}.json`, with the
//!    project ID as quota project, or else application default credentials.
//! 2. Impersonation of the configured service account on top of (1).
//! 3. For scoped requests that (1)/(2) cannot satisfy, user credentials from
//!    the OAuth flow, cached in the secret store or a local file.
//!
//! Results are cached per (organization, project, scopes).

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use log::{debug, info, warn};
use tokio::sync::Mutex;

use stormware_core::auth::organization_id;
use stormware_core::config::{env_non_empty, xdg_config_home};
use stormware_core::{Auth, Error, SecretStore, ToolConfig};

use crate::adc::AdcSources;
use crate::client::GcpClient;
use crate::config::{scopes, AuthorizedUserInfo, Endpoints};
use crate::credentials::{granted_scopes, http_client, Credentials};
use crate::error::{GcpError, GcpResult};
use crate::oauth::{verify_id_token_email, AuthorizationFlow, ClientSecrets, LoopbackFlow, UserTokens};
use crate::secrets::SecretManager;

/// Environment variable consulted when no project is passed in.
pub const PROJECT_ENV: &str = "STORMWARE_PROJECT";
pub const DEFAULT_OAUTH_CLIENT_SECRETS_KEY: &str = "stormware-google-oauth-client-secrets";
pub const DEFAULT_OAUTH_CREDENTIALS_KEY: &str = "stormware-google-oauth-credentials";

type CacheKey = (String, String, Vec<String>);

/// Google Cloud Platform authentication manager.
pub struct GcpAuth {
    auth: Auth,
    project: Option<String>,
    service_account: Option<String>,
    user_email: Option<String>,
    ignore_cached_oauth_credentials: bool,
    oauth_client_secrets_key: String,
    oauth_credentials_key: String,
    config_home: PathBuf,
    endpoints: Endpoints,
    secret_store: Option<Arc<dyn SecretStore>>,
    flow: Arc<dyn AuthorizationFlow>,
    interactive: Option<bool>,
    adc: Option<AdcSources>,
    cache: Mutex<HashMap<CacheKey, Arc<Credentials>>>,
}

/// Where the OAuth user credentials are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OAuthCache {
    Secret(String),
    File(PathBuf),
}

impl OAuthCache {
    async fn load(&self, store: &dyn SecretStore) -> GcpResult<Option<String>> {
        match self {
            Self::Secret(key) => match store.get(key).await {
                Ok(value) => Ok(Some(value)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e.into()),
            },
            Self::File(path) => match std::fs::read_to_string(path) {
                Ok(value) => Ok(Some(value)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(GcpError::io(path, e)),
            },
        }
    }

    async fn save(&self, store: &dyn SecretStore, value: &str) -> GcpResult<()> {
        match self {
            Self::Secret(key) => {
                debug!("Saving OAuth credentials to secret \"{}\"", key);
                store.set(key, value).await?;
            }
            Self::File(path) => {
                debug!("Saving OAuth credentials to \"{}\"", path.display());
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| GcpError::io(parent, e))?;
                }
                std::fs::write(path, value).map_err(|e| GcpError::io(path, e))?;
            }
        }
        Ok(())
    }
}

impl GcpAuth {
    pub fn new(organization: Option<String>, project: Option<String>, config: ToolConfig) -> Self {
        let google = config.google.clone();
        Self {
            auth: Auth::new(organization, config),
            project: project.filter(|p| !p.is_empty()),
            service_account: google.service_account,
            user_email: google.user_email,
            ignore_cached_oauth_credentials: false,
            oauth_client_secrets_key: google
                .oauth_client_secrets_key
                .unwrap_or_else(|| DEFAULT_OAUTH_CLIENT_SECRETS_KEY.to_string()),
            oauth_credentials_key: google
                .oauth_credentials_key
                .unwrap_or_else(|| DEFAULT_OAUTH_CREDENTIALS_KEY.to_string()),
            config_home: xdg_config_home(),
            endpoints: Endpoints::default(),
            secret_store: None,
            flow: Arc::new(LoopbackFlow),
            interactive: None,
            adc: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    // ── Builder ─────────────────────────────────────────────────────────

    /// Impersonate `service_account` instead of the configured one.
    pub fn with_service_account(mut self, service_account: Option<String>) -> Self {
        self.service_account = service_account;
        self
    }

    pub fn with_user_email(mut self, user_email: Option<String>) -> Self {
        self.user_email = user_email;
        self
    }

    /// Always run the interactive flow for user credentials.
    pub fn ignore_cached_oauth_credentials(mut self, ignore: bool) -> Self {
        self.ignore_cached_oauth_credentials = ignore;
        self
    }

    pub fn with_oauth_keys(mut self, client_secrets_key: &str, credentials_key: &str) -> Self {
        self.oauth_client_secrets_key = client_secrets_key.to_string();
        self.oauth_credentials_key = credentials_key.to_string();
        self
    }

    /// Base directory replacing `$XDG_CONFIG_HOME`.
    pub fn with_config_home(mut self, config_home: impl Into<PathBuf>) -> Self {
        self.config_home = config_home.into();
        self
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Store for OAuth client secrets and cached user credentials, instead
    /// of the project's Secret Manager.
    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secret_store = Some(store);
        self
    }

    pub fn with_authorization_flow(mut self, flow: Arc<dyn AuthorizationFlow>) -> Self {
        self.flow = flow;
        self
    }

    /// Override terminal detection on standard input.
    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = Some(interactive);
        self
    }

    /// Fixed application default credential sources instead of the
    /// environment.
    pub fn with_adc_sources(mut self, sources: AdcSources) -> Self {
        self.adc = Some(sources);
        self
    }

    // ── Identity ────────────────────────────────────────────────────────

    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn organization(&self, organization: Option<&str>) -> stormware_core::Result<String> {
        self.auth.organization(organization)
    }

    pub fn organization_id(&self, organization: Option<&str>) -> stormware_core::Result<String> {
        self.auth.organization_id(organization)
    }

    /// First non-empty value of: argument, constructor value,
    /// `STORMWARE_PROJECT`, configured project, package name.
    pub fn project(&self, project: Option<&str>) -> stormware_core::Result<String> {
        let config = self.auth.config();
        project
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .or_else(|| self.project.clone())
            .or_else(|| env_non_empty(PROJECT_ENV))
            .or_else(|| config.project.clone().filter(|p| !p.is_empty()))
            .or_else(|| config.project_name.clone().filter(|p| !p.is_empty()))
            .ok_or(Error::MissingProject)
    }

    /// `{project}-{organization_id}`
    pub fn project_id(
        &self,
        organization: Option<&str>,
        project: Option<&str>,
    ) -> stormware_core::Result<String> {
        Ok(format!(
            "{}-{}",
            self.project(project)?,
            self.organization_id(organization)?
        ))
    }

    /// The organization credentials file, if it exists.
    pub fn credentials_path(&self, organization: Option<&str>) -> stormware_core::Result<Option<PathBuf>> {
        let path = self
            .config_home
            .join("gcloud")
            .join("credentials")
            .join(format!("{}.json", self.organization_id(organization)?));
        Ok(path.is_file().then_some(path))
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    // ── Credentials ─────────────────────────────────────────────────────

    /// Credentials for `organization` and `project` holding `scopes`.
    pub async fn credentials(
        &self,
        organization: Option<&str>,
        project: Option<&str>,
        scopes: &[&str],
    ) -> GcpResult<Arc<Credentials>> {
        let organization = self.organization(organization)?;
        let project = self.project(project)?;
        let mut scopes: Vec<String> = scopes.iter().map(|s| s.to_string()).collect();
        scopes.sort();
        scopes.dedup();
        debug!(
            "Loading credentials for organization \"{}\" and project \"{}\"",
            organization, project
        );

        let key = (organization.clone(), project.clone(), scopes.clone());
        if let Some(cached) = self.cache.lock().await.get(&key) {
            debug!("Using cached credentials");
            return Ok(cached.clone());
        }

        let base = self.base_credentials(&organization, &project).await?;
        let credentials = if scopes.is_empty() {
            base
        } else if let Some(scoped) = base.with_scopes(&scopes) {
            debug!("Using {} credentials with scopes {:?}", scoped.kind_name(), scopes);
            Arc::new(scoped)
        } else if base.has_scopes(&scopes) {
            base
        } else {
            Arc::new(self.user_credentials(&organization, &project, &base, &scopes).await?)
        };

        self.cache.lock().await.insert(key, credentials.clone());
        Ok(credentials)
    }

    /// A client for Google APIs authorized with [`Self::credentials`].
    pub async fn client(
        &self,
        organization: Option<&str>,
        project: Option<&str>,
        scopes: &[&str],
    ) -> GcpResult<GcpClient> {
        let credentials = self.credentials(organization, project, scopes).await?;
        Ok(GcpClient::new(credentials).with_endpoint(self.endpoints.api.clone()))
    }

    async fn base_credentials(&self, organization: &str, project: &str) -> GcpResult<Arc<Credentials>> {
        let key = (organization.to_string(), project.to_string(), Vec::new());
        if let Some(cached) = self.cache.lock().await.get(&key) {
            return Ok(cached.clone());
        }

        let base = match self.credentials_path(Some(organization))? {
            Some(path) => {
                debug!("Loading credentials from file \"{}\"", path.display());
                let project_id = format!("{}-{}", project, organization_id(organization));
                Credentials::from_file(&path)?.with_quota_project(&project_id)
            }
            None => {
                debug!("Loading default credentials");
                match self.adc {
                    Some(ref sources) => sources.resolve().await?,
                    None => {
                        AdcSources::from_env(&self.config_home, &self.endpoints.metadata)
                            .resolve()
                            .await?
                    }
                }
            }
        };

        let base = match self.service_account {
            Some(ref service_account) => {
                debug!("Impersonating service account \"{}\"", service_account);
                Arc::new(Credentials::impersonated(
                    Arc::new(base),
                    service_account,
                    vec![scopes::CLOUD_PLATFORM.to_string()],
                    &self.endpoints.iam_credentials,
                ))
            }
            None => Arc::new(base),
        };

        self.cache.lock().await.insert(key, base.clone());
        Ok(base)
    }

    // ── OAuth user flow ─────────────────────────────────────────────────

    fn is_interactive(&self) -> bool {
        self.interactive
            .unwrap_or_else(|| std::io::stdin().is_terminal())
    }

    fn secret_store(&self, base: &Arc<Credentials>, project_id: &str) -> Arc<dyn SecretStore> {
        match self.secret_store {
            Some(ref store) => store.clone(),
            None => {
                let client = GcpClient::new(base.clone()).with_endpoint(self.endpoints.api.clone());
                Arc::new(SecretManager::new(client, project_id))
            }
        }
    }

    /// The secret when it exists, otherwise the local cache file.
    async fn oauth_cache(&self, store: &dyn SecretStore) -> GcpResult<OAuthCache> {
        let key = &self.oauth_credentials_key;
        if store.exists(key).await? {
            return Ok(OAuthCache::Secret(key.clone()));
        }
        Ok(OAuthCache::File(local_cache_path(&self.config_home, key)))
    }

    async fn user_credentials(
        &self,
        organization: &str,
        project: &str,
        base: &Arc<Credentials>,
        scopes: &[String],
    ) -> GcpResult<Credentials> {
        let project_id = format!("{}-{}", project, organization_id(organization));
        let store = self.secret_store(base, &project_id);
        let cache = self.oauth_cache(store.as_ref()).await?;

        if !self.ignore_cached_oauth_credentials {
            if let Some(cached) = self.load_cached(&cache, store.as_ref(), scopes).await? {
                return Ok(cached);
            }
        }

        if !self.is_interactive() {
            return Err(GcpError::not_interactive());
        }
        let secrets = ClientSecrets::from_json(&store.get(&self.oauth_client_secrets_key).await?)?;

        let mut requested = scopes.to_vec();
        if self.user_email.is_some() {
            for scope in [scopes::OPENID, scopes::USERINFO_EMAIL] {
                if !requested.iter().any(|s| s == scope) {
                    requested.push(scope.to_string());
                }
            }
        }

        info!("Starting the OAuth flow for scopes {:?}", requested);
        let tokens = self.flow.authorize(&secrets, &requested, &self.endpoints).await?;
        if let Some(ref expected) = self.user_email {
            self.verify_email(&tokens, expected).await?;
        }

        let credentials = Credentials::authorized_user(self.user_info(&secrets, &requested, tokens));
        cache.save(store.as_ref(), &credentials.to_json().await?).await?;
        Ok(credentials)
    }

    async fn load_cached(
        &self,
        cache: &OAuthCache,
        store: &dyn SecretStore,
        scopes: &[String],
    ) -> GcpResult<Option<Credentials>> {
        let json = match cache.load(store).await? {
            Some(json) => json,
            None => return Ok(None),
        };
        let cached = match Credentials::from_authorized_user_info(&json) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Ignoring invalid cached OAuth credentials: {}", e);
                return Ok(None);
            }
        };
        if !cached.has_scopes(scopes) {
            debug!("Cached OAuth credentials lack the requested scopes");
            return Ok(None);
        }
        match cached.access_token().await {
            Ok(_) => {
                debug!("Using cached OAuth credentials");
                Ok(Some(cached))
            }
            Err(e) if e.is_invalid_grant() => {
                warn!("Cached OAuth credentials were rejected, re-authenticating: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn verify_email(&self, tokens: &UserTokens, expected: &str) -> GcpResult<()> {
        let id_token = tokens
            .id_token
            .as_deref()
            .ok_or_else(|| GcpError::auth_error("The authorization response carries no ID token"))?;
        let email = verify_id_token_email(&http_client(), &self.endpoints.tokeninfo, id_token).await?;
        if !email.eq_ignore_ascii_case(expected) {
            return Err(GcpError::invalid_email(expected, &email));
        }
        Ok(())
    }

    fn user_info(&self, secrets: &ClientSecrets, requested: &[String], tokens: UserTokens) -> AuthorizedUserInfo {
        AuthorizedUserInfo {
            scopes: granted_scopes(tokens.scope.as_deref(), requested),
            expiry: tokens
                .expires_in
                .map(|secs| (Utc::now() + Duration::seconds(secs)).to_rfc3339()),
            token: Some(tokens.access_token),
            refresh_token: tokens.refresh_token,
            token_uri: self.endpoints.token.clone(),
            client_id: secrets.client_id.clone(),
            client_secret: secrets.client_secret.clone(),
            quota_project_id: None,
        }
    }
}

/// `{config_home}/stormware/google/{key}.json`
pub fn local_cache_path(config_home: &Path, key: &str) -> PathBuf {
    config_home
        .join("stormware")
        .join("google")
        .join(format!("{}.json", key))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
