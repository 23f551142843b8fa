//! # stormware-aws
//!
//! Organization-scoped access to Amazon Web Services.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  SecretsManager  (secrets.rs)                │
//! │  └── SecretStore over the JSON protocol      │
//! ├──────────────────────────────────────────────┤
//! │  AwsAuth → AwsSession  (auth.rs)             │
//! │  └── named profile = organization ID         │
//! ├──────────────────────────────────────────────┤
//! │  AwsClient  (client.rs)                      │
//! │  └── json_request · retry with full jitter   │
//! ├──────────────────────────────────────────────┤
//! │  SigV4Signer  (signing.rs)                   │
//! └──────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod secrets;
pub mod signing;

pub use auth::{AwsAuth, AwsSession};
pub use client::AwsClient;
pub use config::{AwsCredentials, AwsRegion, RetryConfig};
pub use error::{AwsError, AwsResult};
pub use secrets::SecretsManager;
