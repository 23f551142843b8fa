//! # stormware-gcp
//!
//! Google Cloud credential resolution plus the Secret Manager and BigQuery
//! connectors. The Drive, Gmail and Sheets crates build on [`GcpAuth`] and
//! [`GcpClient`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  SecretManager · BigQuery   (secrets.rs, bigquery.rs)│
//! ├──────────────────────────────────────────────────────┤
//! │  GcpClient  (client.rs)                              │
//! │  └── bearer token · x-goog-user-project · retries    │
//! ├──────────────────────────────────────────────────────┤
//! │  GcpAuth  (auth.rs)                                  │
//! │  ├── organization file │ ADC (adc.rs)                │
//! │  ├── service account impersonation                   │
//! │  └── OAuth user flow (oauth.rs) + cache              │
//! ├──────────────────────────────────────────────────────┤
//! │  Credentials  (credentials.rs)                       │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod adc;
pub mod auth;
pub mod bigquery;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod oauth;
pub mod secrets;

pub use adc::AdcSources;
pub use auth::GcpAuth;
pub use bigquery::BigQuery;
pub use client::GcpClient;
pub use config::{scopes, Endpoints};
pub use credentials::Credentials;
pub use error::{GcpError, GcpResult};
pub use oauth::{AuthorizationFlow, ClientSecrets, LoopbackFlow, UserTokens};
pub use secrets::SecretManager;
