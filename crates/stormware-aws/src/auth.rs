//! Named-profile resolution for an organization.

use std::collections::BTreeSet;

use aws_config::environment::credentials::EnvironmentVariableCredentialsProvider;
use aws_config::profile::profile_file::{ProfileFileKind, ProfileFiles};
use aws_config::profile::{ProfileFileCredentialsProvider, ProfileSet};
use aws_config::provider_config::ProviderConfig;
use aws_config::Region;
use aws_credential_types::provider::ProvideCredentials;
use aws_types::os_shim_internal::{Env, Fs};
use log::debug;

use stormware_core::config::{env_non_empty, expand_home};
use stormware_core::{Auth, ToolConfig};

use crate::client::AwsClient;
use crate::config::{AwsCredentials, AwsRegion, DEFAULT_REGION};
use crate::error::{AwsError, AwsResult};

/// Amazon Web Services authentication manager.
///
/// The profile of an organization is the shared-config profile named after
/// its organization ID. Static keys, `role_arn`/`source_profile`, SSO and
/// `credential_process` profiles all resolve through `aws-config`.
#[derive(Debug, Clone)]
pub struct AwsAuth {
    auth: Auth,
    files: ProfileFiles,
    profiles: ProfileSet,
    endpoint_override: Option<String>,
}

impl AwsAuth {
    /// Load the profiles of the file named by `aws.credentials_file`, or of
    /// `~/.aws/credentials` and `~/.aws/config` when none is configured.
    pub async fn new(organization: Option<String>, config: ToolConfig) -> AwsResult<Self> {
        let files = match config.aws.credentials_file.as_deref().map(expand_home) {
            Some(path) if path.exists() => ProfileFiles::builder()
                .include_default_credentials_file(false)
                .include_default_config_file(false)
                .with_file(ProfileFileKind::Credentials, path)
                .build(),
            Some(path) => {
                debug!(
                    "Named profile credentials file \"{}\" does not exist",
                    path.display()
                );
                ProfileFiles::builder()
                    .include_default_credentials_file(false)
                    .include_default_config_file(false)
                    .build()
            }
            None => ProfileFiles::default(),
        };
        let profiles = aws_config::profile::load(&Fs::real(), &Env::real(), &files, None)
            .await
            .map_err(|e| AwsError::credential_error(&format!("Cannot read AWS profiles: {}", e)))?;
        Ok(Self {
            auth: Auth::new(organization, config),
            files,
            profiles,
            endpoint_override: env_non_empty("AWS_ENDPOINT_URL"),
        })
    }

    /// Send every request to `endpoint` instead of the regional endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into());
        self
    }

    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    /// The available named profiles.
    pub fn profiles(&self) -> BTreeSet<&str> {
        self.profiles.profiles().collect()
    }

    /// The organization ID if a profile of that name exists.
    pub fn profile(&self, organization: Option<&str>) -> AwsResult<Option<String>> {
        let organization_id = self.auth.organization_id(organization)?;
        if self.profiles.get_profile(&organization_id).is_some() {
            debug!("Using named profile \"{}\"", organization_id);
            Ok(Some(organization_id))
        } else {
            Ok(None)
        }
    }

    /// Credentials and region for `organization`.
    ///
    /// An organization with a profile gets that profile's credentials or an
    /// error. Otherwise credentials come from the environment, then the
    /// `default` profile.
    pub async fn session(
        &self,
        organization: Option<&str>,
        region: Option<&str>,
    ) -> AwsResult<AwsSession> {
        let profile = self.profile(organization)?;

        let profile_region = self
            .profiles
            .get_profile(profile.as_deref().unwrap_or("default"))
            .and_then(|p| p.get("region"))
            .map(str::to_string);
        let region = region
            .map(str::to_string)
            .or_else(|| env_non_empty("AWS_REGION"))
            .or_else(|| env_non_empty("AWS_DEFAULT_REGION"))
            .or(profile_region)
            .or_else(|| self.auth.config().aws.region.clone())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let credentials = match profile.as_deref() {
            Some(name) => self.profile_credentials(name, &region).await?,
            None => self.default_credentials(&region).await?,
        };

        debug!(
            "AWS session using {} credentials in {}",
            credentials.provider_name, region
        );
        Ok(AwsSession {
            profile,
            credentials,
            region: AwsRegion::new(&region),
            endpoint_override: self.endpoint_override.clone(),
        })
    }

    async fn profile_credentials(&self, name: &str, region: &str) -> AwsResult<AwsCredentials> {
        let provider_config =
            ProviderConfig::without_region().with_region(Some(Region::new(region.to_string())));
        let provider = ProfileFileCredentialsProvider::builder()
            .configure(&provider_config)
            .profile_files(self.files.clone())
            .profile_name(name)
            .build();
        let credentials = provider.provide_credentials().await.map_err(|e| {
            AwsError::credential_error(&format!(
                "Profile \"{}\" has no usable credentials: {}",
                name, e
            ))
        })?;
        Ok(AwsCredentials::from_provider(
            &credentials,
            &format!("profile:{}", name),
        ))
    }

    async fn default_credentials(&self, region: &str) -> AwsResult<AwsCredentials> {
        if let Ok(credentials) = EnvironmentVariableCredentialsProvider::new()
            .provide_credentials()
            .await
        {
            return Ok(AwsCredentials::from_provider(&credentials, "environment"));
        }
        if self.profiles.get_profile("default").is_some() {
            return self.profile_credentials("default", region).await;
        }
        Err(AwsError::credential_error(
            "No AWS credentials found in the environment or a \"default\" profile",
        ))
    }
}

/// Resolved credentials and region.
#[derive(Debug, Clone)]
pub struct AwsSession {
    /// Named profile in use, if the organization has one.
    pub profile: Option<String>,
    pub credentials: AwsCredentials,
    pub region: AwsRegion,
    endpoint_override: Option<String>,
}

impl AwsSession {
    pub fn client(&self) -> AwsClient {
        AwsClient::new(self.credentials.clone(), self.region.clone())
            .with_endpoint(self.endpoint_override.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use stormware_core::config::AwsConfig;

    async fn auth_with(text: &str) -> (tempfile::TempDir, AwsAuth) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        std::fs::write(&path, text).unwrap();
        let config = ToolConfig {
            organization: Some("acme.example.com".into()),
            aws: AwsConfig {
                credentials_file: Some(path),
                region: Some("ap-southeast-2".into()),
            },
            ..ToolConfig::default()
        };
        (dir, AwsAuth::new(None, config).await.unwrap())
    }

    fn region_from_env() -> bool {
        std::env::var_os("AWS_REGION").is_some() || std::env::var_os("AWS_DEFAULT_REGION").is_some()
    }

    const CREDENTIALS: &str = "\
[default]
aws_access_key_id = AKIDDEFAULT
aws_secret_access_key = default-secret

[acme-example-com]
aws_access_key_id = AKIDACME
aws_secret_access_key = acme-secret
region = eu-central-1
";

    #[tokio::test]
    async fn lists_profiles() {
        let (_dir, auth) = auth_with(CREDENTIALS).await;
        assert_eq!(
            auth.profiles().into_iter().collect::<Vec<_>>(),
            vec!["acme-example-com", "default"]
        );
    }

    #[tokio::test]
    async fn profile_matches_organization_id() {
        let (_dir, auth) = auth_with(CREDENTIALS).await;
        assert_eq!(auth.profile(None).unwrap().as_deref(), Some("acme-example-com"));
        assert_eq!(auth.profile(Some("other.org")).unwrap(), None);
    }

    #[tokio::test]
    async fn session_prefers_organization_profile() {
        let (_dir, auth) = auth_with(CREDENTIALS).await;
        let session = auth.session(None, Some("us-west-2")).await.unwrap();
        assert_eq!(session.profile.as_deref(), Some("acme-example-com"));
        assert_eq!(session.credentials.access_key_id, "AKIDACME");
        assert_eq!(session.credentials.provider_name, "profile:acme-example-com");
        assert_eq!(session.region.name, "us-west-2");
    }

    #[tokio::test]
    async fn session_region_from_profile() {
        if region_from_env() {
            return;
        }
        let (_dir, auth) = auth_with(CREDENTIALS).await;
        let session = auth.session(None, None).await.unwrap();
        assert_eq!(session.region.name, "eu-central-1");
    }

    #[tokio::test]
    async fn session_falls_back_to_config_region() {
        if region_from_env() {
            return;
        }
        let (_dir, auth) =
            auth_with("[acme-example-com]\naws_access_key_id = A\naws_secret_access_key = B\n").await;
        let session = auth.session(None, None).await.unwrap();
        assert_eq!(session.region.name, "ap-southeast-2");
    }

    #[tokio::test]
    async fn unknown_organization_uses_default_profile() {
        if std::env::var_os("AWS_ACCESS_KEY_ID").is_some() {
            return;
        }
        let (_dir, auth) = auth_with(CREDENTIALS).await;
        let session = auth.session(Some("other.org"), Some("us-east-1")).await.unwrap();
        assert!(session.profile.is_none());
        assert_eq!(session.credentials.access_key_id, "AKIDDEFAULT");
        assert_eq!(session.credentials.provider_name, "profile:default");
    }

    #[tokio::test]
    async fn organization_profile_without_keys_is_an_error() {
        let (_dir, auth) = auth_with(
            "[default]\naws_access_key_id = AKIDDEFAULT\naws_secret_access_key = s\n\n\
             [acme-example-com]\nregion = eu-west-1\n",
        )
        .await;
        let err = auth.session(None, Some("eu-west-1")).await.unwrap_err();
        assert!(err.to_string().contains("acme-example-com"), "{}", err);
    }

    #[tokio::test]
    async fn role_profile_never_reports_default_keys() {
        let (_dir, auth) = auth_with(
            "[default]\naws_access_key_id = AKIDDEFAULT\naws_secret_access_key = s\n\n\
             [acme-example-com]\n\
             role_arn = arn:aws:iam::123456789012:role/stormware\n\
             source_profile = missing-source\n",
        )
        .await;
        match auth.session(None, Some("us-east-1")).await {
            Ok(session) => assert_ne!(session.credentials.access_key_id, "AKIDDEFAULT"),
            Err(err) => assert!(err.to_string().contains("acme-example-com"), "{}", err),
        }
    }

    #[tokio::test]
    async fn missing_credentials_file() {
        let config = ToolConfig {
            organization: Some("acme.example.com".into()),
            aws: AwsConfig {
                credentials_file: Some(PathBuf::from("/nonexistent/stormware/credentials")),
                region: None,
            },
            ..ToolConfig::default()
        };
        let auth = AwsAuth::new(None, config).await.unwrap();
        assert!(auth.profiles().is_empty());
        assert_eq!(auth.profile(None).unwrap(), None);
    }
}
