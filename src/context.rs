//! Shared organization/project context and the default secret store.

use std::sync::Arc;

use log::debug;

use stormware_core::{SecretError, SecretResult, SecretStore, ToolConfig};

#[cfg(feature = "amazon")]
use stormware_aws::{AwsAuth, AwsResult};
#[cfg(feature = "google")]
use stormware_gcp::GcpAuth;

/// Organization, project and configuration every connector starts from.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub organization: Option<String>,
    pub project: Option<String>,
    pub config: ToolConfig,
}

impl Context {
    pub fn new(organization: Option<String>, project: Option<String>, config: ToolConfig) -> Self {
        Self {
            organization,
            project,
            config,
        }
    }

    /// Context with the configuration discovered from the working directory.
    pub fn discover(
        organization: Option<String>,
        project: Option<String>,
    ) -> stormware_core::Result<Self> {
        Ok(Self::new(organization, project, ToolConfig::discover()?))
    }

    #[cfg(feature = "google")]
    pub fn gcp_auth(&self) -> GcpAuth {
        GcpAuth::new(
            self.organization.clone(),
            self.project.clone(),
            self.config.clone(),
        )
    }

    #[cfg(feature = "amazon")]
    pub async fn aws_auth(&self) -> AwsResult<AwsAuth> {
        AwsAuth::new(self.organization.clone(), self.config.clone()).await
    }
}

/// The explicit store, else Google Secret Manager, else AWS Secrets Manager,
/// depending on the enabled features.
pub async fn default_secret_store(
    explicit: Option<Arc<dyn SecretStore>>,
    context: &Context,
) -> SecretResult<Arc<dyn SecretStore>> {
    if let Some(store) = explicit {
        return Ok(store);
    }

    #[cfg(feature = "google")]
    {
        debug!("Using Google Cloud Secret Manager");
        let auth = context.gcp_auth();
        let manager = stormware_gcp::SecretManager::connect(&auth, None, None)
            .await
            .map_err(|e| SecretError::backend("Google Secret Manager", e.to_string()))?;
        return Ok(Arc::new(manager));
    }

    #[cfg(all(feature = "amazon", not(feature = "google")))]
    {
        debug!("Using AWS Secrets Manager");
        let auth = context
            .aws_auth()
            .await
            .map_err(|e| SecretError::backend("AWS Secrets Manager", e.to_string()))?;
        let manager = stormware_aws::SecretsManager::connect(&auth, None)
            .await
            .map_err(|e| SecretError::backend("AWS Secrets Manager", e.to_string()))?;
        return Ok(Arc::new(manager));
    }

    #[cfg(not(any(feature = "google", feature = "amazon")))]
    {
        let _ = context;
        debug!("No secret store backend enabled");
        Err(SecretError::NoBackend)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
