//! Organization resolution shared by every provider.

use log::debug;

use crate::config::{env_non_empty, ToolConfig};
use crate::error::{Error, Result};

/// Environment variable consulted when no organization is passed in.
pub const ORGANIZATION_ENV: &str = "STORMWARE_ORGANIZATION";

/// Resolves the organization a connector acts on behalf of.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    organization: Option<String>,
    config: ToolConfig,
}

impl Auth {
    pub fn new(organization: Option<String>, config: ToolConfig) -> Self {
        Self {
            organization: organization.filter(|o| !o.is_empty()),
            config,
        }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    /// First non-empty value of: argument, constructor value,
    /// `STORMWARE_ORGANIZATION`, configuration.
    pub fn organization(&self, organization: Option<&str>) -> Result<String> {
        let resolved = organization
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .or_else(|| self.organization.clone())
            .or_else(|| env_non_empty(ORGANIZATION_ENV))
            .or_else(|| self.config.organization.clone().filter(|o| !o.is_empty()))
            .ok_or(Error::MissingOrganization)?;
        debug!("Using organization \"{}\"", resolved);
        Ok(resolved)
    }

    /// Cloud-safe identifier for the organization.
    pub fn organization_id(&self, organization: Option<&str>) -> Result<String> {
        Ok(organization_id(&self.organization(organization)?))
    }
}

/// `example.org` becomes `example-org`.
pub fn organization_id(organization: &str) -> String {
    organization.replace('.', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(org: Option<&str>) -> ToolConfig {
        ToolConfig {
            organization: org.map(str::to_string),
            ..ToolConfig::default()
        }
    }

    #[test]
    fn argument_wins() {
        let auth = Auth::new(Some("ctor.io".into()), config(Some("conf.io")));
        assert_eq!(auth.organization(Some("arg.io")).unwrap(), "arg.io");
        assert_eq!(auth.organization(None).unwrap(), "ctor.io");
    }

    #[test]
    fn empty_values_are_unset() {
        let auth = Auth::new(Some(String::new()), config(Some("conf.io")));
        if std::env::var_os(ORGANIZATION_ENV).is_none() {
            assert_eq!(auth.organization(Some("")).unwrap(), "conf.io");
        }
    }

    #[test]
    fn missing_organization() {
        if std::env::var_os(ORGANIZATION_ENV).is_some() {
            return;
        }
        let auth = Auth::new(None, config(None));
        let err = auth.organization(None).unwrap_err();
        assert_eq!(err.to_string(), "You must provide an organization");
    }

    #[test]
    fn dots_become_dashes() {
        let auth = Auth::new(Some("acme.example.com".into()), ToolConfig::default());
        assert_eq!(auth.organization_id(None).unwrap(), "acme-example-com");
        assert_eq!(organization_id("plain"), "plain");
    }
}
