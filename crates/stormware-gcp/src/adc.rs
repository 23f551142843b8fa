//! Application Default Credentials.
//!
//! Resolution order:
//! 1) Environment variable `GOOGLE_OAUTH_ACCESS_TOKEN`
//! 2) Credentials file named by `GOOGLE_APPLICATION_CREDENTIALS`
//! 3) gcloud's `application_default_credentials.json`
//! 4) GCE/GKE metadata server, unless `NO_GCE_CHECK` is set

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

use stormware_core::config::env_non_empty;

use crate::credentials::{http_client, Credentials};
use crate::error::{GcpError, GcpResult};

const METADATA_HEADER: &str = "Metadata-Flavor";
const METADATA_HEADER_VALUE: &str = "Google";
const METADATA_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// The candidate sources, captured up front so resolution is deterministic.
#[derive(Debug, Clone, Default)]
pub struct AdcSources {
    pub access_token: Option<String>,
    pub credentials_file: Option<PathBuf>,
    pub well_known_file: Option<PathBuf>,
    /// Metadata server root, `None` to skip the metadata check.
    pub metadata: Option<String>,
}

impl AdcSources {
    /// Sources from the process environment.
    pub fn from_env(config_home: &Path, metadata_endpoint: &str) -> Self {
        let skip_metadata = env_non_empty("NO_GCE_CHECK")
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false"))
            .unwrap_or(false);
        Self {
            access_token: env_non_empty("GOOGLE_OAUTH_ACCESS_TOKEN"),
            credentials_file: env_non_empty("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from),
            well_known_file: Some(well_known_file(config_home)),
            metadata: (!skip_metadata).then(|| metadata_endpoint.to_string()),
        }
    }

    pub async fn resolve(&self) -> GcpResult<Credentials> {
        let mut tried = Vec::new();

        if let Some(ref token) = self.access_token {
            debug!("Using GOOGLE_OAUTH_ACCESS_TOKEN");
            return Ok(Credentials::from_access_token(token));
        }
        tried.push("GOOGLE_OAUTH_ACCESS_TOKEN".to_string());

        if let Some(ref path) = self.credentials_file {
            debug!("Using GOOGLE_APPLICATION_CREDENTIALS \"{}\"", path.display());
            return Credentials::from_file(path);
        }
        tried.push("GOOGLE_APPLICATION_CREDENTIALS".to_string());

        if let Some(ref path) = self.well_known_file {
            if path.is_file() {
                debug!("Using application default credentials \"{}\"", path.display());
                return Credentials::from_file(path);
            }
            tried.push(format!("\"{}\"", path.display()));
        }

        if let Some(ref endpoint) = self.metadata {
            if metadata_reachable(endpoint).await {
                debug!("Using metadata server credentials");
                return Ok(Credentials::metadata(endpoint));
            }
            tried.push("metadata server".to_string());
        }

        Err(GcpError::auth_error(format!(
            "Could not find default credentials (tried {})",
            tried.join(", ")
        )))
    }
}

/// `{config_home}/gcloud/application_default_credentials.json`
pub fn well_known_file(config_home: &Path) -> PathBuf {
    config_home
        .join("gcloud")
        .join("application_default_credentials.json")
}

async fn metadata_reachable(endpoint: &str) -> bool {
    let url = format!("{}/computeMetadata/v1/instance", endpoint.trim_end_matches('/'));
    let response = http_client()
        .get(&url)
        .header(METADATA_HEADER, METADATA_HEADER_VALUE)
        .timeout(METADATA_CHECK_TIMEOUT)
        .send()
        .await;
    match response {
        Ok(r) => {
            r.status().is_success()
                && r.headers()
                    .get(METADATA_HEADER)
                    .map(|v| v == METADATA_HEADER_VALUE)
                    .unwrap_or(false)
        }
        Err(e) => {
            debug!("Metadata server check failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn access_token_wins() {
        let sources = AdcSources {
            access_token: Some("ya29.env".into()),
            credentials_file: Some(PathBuf::from("/nonexistent.json")),
            ..AdcSources::default()
        };
        let credentials = sources.resolve().await.unwrap();
        assert_eq!(credentials.access_token().await.unwrap(), "ya29.env");
    }

    #[tokio::test]
    async fn well_known_file_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let file = well_known_file(dir.path());
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(
            &file,
            r#"{"type":"authorized_user","client_id":"c","client_secret":"s","refresh_token":"r"}"#,
        )
        .unwrap();

        let sources = AdcSources {
            well_known_file: Some(file),
            ..AdcSources::default()
        };
        assert_eq!(sources.resolve().await.unwrap().kind_name(), "authorized user");
    }

    #[tokio::test]
    async fn metadata_server_detection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/computeMetadata/v1/instance"))
            .and(header("metadata-flavor", "Google"))
            .respond_with(ResponseTemplate::new(200).insert_header("Metadata-Flavor", "Google"))
            .mount(&server)
            .await;

        let sources = AdcSources {
            metadata: Some(server.uri()),
            ..AdcSources::default()
        };
        assert_eq!(sources.resolve().await.unwrap().kind_name(), "metadata server");
    }

    #[tokio::test]
    async fn nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        let sources = AdcSources {
            well_known_file: Some(well_known_file(dir.path())),
            ..AdcSources::default()
        };
        let err = sources.resolve().await.unwrap_err();
        assert!(err.message.starts_with("Could not find default credentials"));
        assert!(err.message.contains("GOOGLE_APPLICATION_CREDENTIALS"));
    }
}
