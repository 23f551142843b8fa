//! # stormware-core
//!
//! Building blocks shared by every stormware connector.
//!
//! | Module    | Purpose                                                        |
//! |-----------|----------------------------------------------------------------|
//! | `config`  | tool configuration discovery and XDG base directories          |
//! | `auth`    | organization name / organization ID resolution                 |
//! | `secrets` | the [`SecretStore`] trait and an in-process implementation     |
//! | `table`   | a small typed table used by BigQuery, Sheets and Facebook Ads  |
//! | `error`   | configuration and secret-store error types                     |

pub mod auth;
pub mod config;
pub mod error;
pub mod secrets;
pub mod table;

pub use auth::Auth;
pub use config::ToolConfig;
pub use error::{Error, Result, SecretError, SecretResult};
pub use secrets::{MemorySecretStore, SecretStore};
pub use table::{Cell, ColumnType, Table};
