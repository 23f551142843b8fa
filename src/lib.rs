//! # stormware
//!
//! Organization-scoped credential resolution and thin connectors for Amazon
//! Web Services, Google Cloud and Facebook Ads.
//!
//! ```text
//! Context (organization, project, ToolConfig)
//!   ├── GcpAuth ──► SecretManager · BigQuery · Drive · Gmail · Spreadsheet
//!   ├── AwsAuth ──► SecretsManager
//!   └── default_secret_store ──► FacebookAds
//! ```
//!
//! Each provider lives behind a feature: `google`, `amazon` and `facebook`
//! (all enabled by default).

pub mod context;
pub mod logging;

pub use context::{default_secret_store, Context};

pub use stormware_core as core;
pub use stormware_core::{
    Auth, Cell, ColumnType, Error, MemorySecretStore, Result, SecretError, SecretResult,
    SecretStore, Table, ToolConfig,
};

#[cfg(feature = "amazon")]
pub use stormware_aws as aws;
#[cfg(feature = "facebook")]
pub use stormware_facebook as facebook;
#[cfg(feature = "google")]
pub use stormware_gcp as gcp;
#[cfg(feature = "google")]
pub use stormware_gdrive as gdrive;
#[cfg(feature = "google")]
pub use stormware_gmail as gmail;
#[cfg(feature = "google")]
pub use stormware_gsheets as gsheets;
