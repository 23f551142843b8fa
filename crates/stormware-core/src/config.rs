//! Tool configuration discovery.
//!
//! Settings are read from the nearest manifest found by walking up from the
//! working directory:
//!
//! | File             | Section                         | Project name     |
//! |------------------|---------------------------------|------------------|
//! | `stormware.toml` | top level                       | –                |
//! | `Cargo.toml`     | `[package.metadata.stormware]`  | `package.name`   |
//! | `pyproject.toml` | `[tool.stormware]`              | `project.name`   |

use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ── Types ───────────────────────────────────────────────────────────────

/// The manifest flavours a configuration can be read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Stormware,
    Cargo,
    PyProject,
}

impl ManifestKind {
    /// Search order within a single directory.
    pub const ALL: [ManifestKind; 3] = [Self::Stormware, Self::Cargo, Self::PyProject];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Stormware => "stormware.toml",
            Self::Cargo => "Cargo.toml",
            Self::PyProject => "pyproject.toml",
        }
    }
}

/// Google specific settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleConfig {
    /// Service account to impersonate on top of the resolved credentials.
    pub service_account: Option<String>,
    /// Expected e-mail address of the user completing the OAuth flow.
    pub user_email: Option<String>,
    /// Secret holding the OAuth client ID and secret.
    pub oauth_client_secrets_key: Option<String>,
    /// Secret caching the authorized user credentials.
    pub oauth_credentials_key: Option<String>,
}

/// AWS specific settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// Named profile credentials file (defaults to `~/.aws/credentials`).
    pub credentials_file: Option<PathBuf>,
    /// Region used when none is given explicitly or via the environment.
    pub region: Option<String>,
}

/// Resolved tool configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub organization: Option<String>,
    pub project: Option<String>,
    pub google: GoogleConfig,
    pub aws: AwsConfig,
    /// Name of the enclosing package, used as the fallback project.
    #[serde(skip)]
    pub project_name: Option<String>,
    /// File the configuration was read from.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

// ── Discovery ───────────────────────────────────────────────────────────

impl ToolConfig {
    /// Discover the configuration starting at the current directory.
    pub fn discover() -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|e| Error::io(".", e))?;
        Self::discover_from(&cwd)
    }

    /// Discover the configuration starting at `start` and walking up.
    pub fn discover_from(start: &Path) -> Result<Self> {
        for dir in start.ancestors() {
            for kind in ManifestKind::ALL {
                let path = dir.join(kind.file_name());
                if !path.is_file() {
                    continue;
                }
                debug!("Loading configuration from \"{}\"", path.display());
                let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
                let mut config = Self::from_toml_str(kind, &text).map_err(|message| {
                    Error::InvalidConfig {
                        path: path.clone(),
                        message,
                    }
                })?;
                config.source = Some(path);
                return Ok(config);
            }
        }
        debug!(
            "No configuration file found above \"{}\", using defaults",
            start.display()
        );
        Ok(Self::default())
    }

    /// Parse the stormware section out of a manifest of the given kind.
    pub fn from_toml_str(kind: ManifestKind, text: &str) -> std::result::Result<Self, String> {
        let root: toml::Table = toml::from_str(text).map_err(|e| e.to_string())?;

        let (section, project_name) = match kind {
            ManifestKind::Stormware => (Some(toml::Value::Table(root.clone())), None),
            ManifestKind::Cargo => (
                lookup(&root, &["package", "metadata", "stormware"]),
                lookup_str(&root, &["package", "name"]),
            ),
            ManifestKind::PyProject => (
                lookup(&root, &["tool", "stormware"]),
                lookup_str(&root, &["project", "name"]),
            ),
        };

        let mut config: ToolConfig = match section {
            Some(value) => value.try_into().map_err(|e: toml::de::Error| e.to_string())?,
            None => ToolConfig::default(),
        };
        config.project_name = project_name;
        Ok(config)
    }
}

fn lookup(root: &toml::Table, keys: &[&str]) -> Option<toml::Value> {
    let (first, rest) = keys.split_first()?;
    let mut value = root.get(*first)?;
    for key in rest {
        value = value.get(*key)?;
    }
    Some(value.clone())
}

fn lookup_str(root: &toml::Table, keys: &[&str]) -> Option<String> {
    lookup(root, keys).and_then(|v| v.as_str().map(str::to_string))
}

// ── Base directories ────────────────────────────────────────────────────

/// `$XDG_CONFIG_HOME`, falling back to `~/.config`.
pub fn xdg_config_home() -> PathBuf {
    match std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from) {
        Some(path) if path.is_absolute() => path,
        _ => dirs::home_dir().unwrap_or_default().join(".config"),
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().unwrap_or_default().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Read an environment variable, treating empty values as unset.
pub fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stormware_toml() {
        let text = r#"
            organization = "example.org"
            project = "demo"

            [google]
            service_account = "robot@demo.iam.gserviceaccount.com"

            [aws]
            region = "eu-west-1"
        "#;
        let config = ToolConfig::from_toml_str(ManifestKind::Stormware, text).unwrap();
        assert_eq!(config.organization.as_deref(), Some("example.org"));
        assert_eq!(config.project.as_deref(), Some("demo"));
        assert_eq!(
            config.google.service_account.as_deref(),
            Some("robot@demo.iam.gserviceaccount.com")
        );
        assert_eq!(config.aws.region.as_deref(), Some("eu-west-1"));
        assert!(config.project_name.is_none());
    }

    #[test]
    fn parse_cargo_metadata() {
        let text = r#"
            [package]
            name = "reporting"
            version = "0.1.0"

            [package.metadata.stormware]
            organization = "example.org"
        "#;
        let config = ToolConfig::from_toml_str(ManifestKind::Cargo, text).unwrap();
        assert_eq!(config.organization.as_deref(), Some("example.org"));
        assert_eq!(config.project_name.as_deref(), Some("reporting"));
        assert!(config.project.is_none());
    }

    #[test]
    fn parse_pyproject_without_section() {
        let text = r#"
            [project]
            name = "analytics"
        "#;
        let config = ToolConfig::from_toml_str(ManifestKind::PyProject, text).unwrap();
        assert!(config.organization.is_none());
        assert_eq!(config.project_name.as_deref(), Some("analytics"));
    }

    #[test]
    fn parse_invalid_toml() {
        assert!(ToolConfig::from_toml_str(ManifestKind::Stormware, "organization = ").is_err());
    }

    #[test]
    fn discover_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pyproject.toml"),
            "[project]\nname = \"walker\"\n\n[tool.stormware]\norganization = \"walk.io\"\n",
        )
        .unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        let config = ToolConfig::discover_from(&nested).unwrap();
        assert_eq!(config.organization.as_deref(), Some("walk.io"));
        assert_eq!(config.project_name.as_deref(), Some("walker"));
        assert_eq!(config.source, Some(dir.path().join("pyproject.toml")));
    }

    #[test]
    fn discover_prefers_stormware_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stormware.toml"), "organization = \"first.io\"\n").unwrap();
        std::fs::write(
            dir.path().join("Cargo.toml"),
            "[package]\nname = \"second\"\n[package.metadata.stormware]\norganization = \"second.io\"\n",
        )
        .unwrap();

        let config = ToolConfig::discover_from(dir.path()).unwrap();
        assert_eq!(config.organization.as_deref(), Some("first.io"));
    }

    #[test]
    fn discover_reports_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stormware.toml"), "[google\n").unwrap();
        let err = ToolConfig::discover_from(dir.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn expand_home_prefix() {
        let home = dirs::home_dir().unwrap_or_default();
        assert_eq!(expand_home(Path::new("~/data")), home.join("data"));
        assert_eq!(expand_home(Path::new("/tmp/data")), PathBuf::from("/tmp/data"));
    }
}
