//! AWS regions, credentials and retry settings.

use aws_credential_types::Credentials;

/// Region used when nothing else names one.
pub const DEFAULT_REGION: &str = "us-east-1";

// ── Regions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsRegion {
    /// Region code (e.g. "eu-west-1").
    pub name: String,
}

impl AwsRegion {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// `https://{service}.{region}.amazonaws.com`, with the `.cn` suffix in
    /// the China partition.
    pub fn endpoint(&self, service: &str) -> String {
        if self.name.starts_with("cn-") {
            format!("https://{}.{}.amazonaws.com.cn", service, self.name)
        } else {
            format!("https://{}.{}.amazonaws.com", service, self.name)
        }
    }
}

impl Default for AwsRegion {
    fn default() -> Self {
        Self::new(DEFAULT_REGION)
    }
}

// ── Credentials ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Present for temporary credentials.
    pub session_token: Option<String>,
    /// Where the credentials came from, for logging.
    pub provider_name: String,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field("session_token", &self.session_token.as_ref().map(|_| "** redacted **"))
            .field("provider_name", &self.provider_name)
            .finish()
    }
}

impl AwsCredentials {
    pub fn new(access_key_id: &str, secret_access_key: &str) -> Self {
        Self {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            session_token: None,
            provider_name: "static".to_string(),
        }
    }

    /// Keys resolved by an `aws-config` credentials provider.
    pub fn from_provider(credentials: &Credentials, provider_name: &str) -> Self {
        Self {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().map(str::to_string),
            provider_name: provider_name.to_string(),
        }
    }
}

// ── Retries ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 20_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_credentials() {
        let resolved = Credentials::new("AKIDROLE", "role-secret", Some("session".into()), None, "test");
        let creds = AwsCredentials::from_provider(&resolved, "profile:acme-example-com");
        assert_eq!(creds.access_key_id, "AKIDROLE");
        assert_eq!(creds.secret_access_key, "role-secret");
        assert_eq!(creds.session_token.as_deref(), Some("session"));
        assert_eq!(creds.provider_name, "profile:acme-example-com");
    }

    #[test]
    fn region_endpoints() {
        assert_eq!(
            AwsRegion::new("eu-west-1").endpoint("secretsmanager"),
            "https://secretsmanager.eu-west-1.amazonaws.com"
        );
        assert_eq!(
            AwsRegion::new("cn-north-1").endpoint("secretsmanager"),
            "https://secretsmanager.cn-north-1.amazonaws.com.cn"
        );
        assert_eq!(AwsRegion::default().name, "us-east-1");
    }

    #[test]
    fn debug_redacts_secret() {
        let creds = AwsCredentials::new("AKID", "very-secret");
        assert!(!format!("{:?}", creds).contains("very-secret"));
    }
}
