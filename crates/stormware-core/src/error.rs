//! Error types shared across connectors.

use std::path::PathBuf;

/// Configuration and identity resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("You must provide an organization")]
    MissingOrganization,

    #[error("You must provide a project")]
    MissingProject,

    #[error("Failed to read \"{path}\": {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration file \"{path}\": {message}")]
    InvalidConfig { path: PathBuf, message: String },

    #[error("Row has {actual} cells but the table has {expected} columns")]
    RowWidth { expected: usize, actual: usize },

    #[error("Unknown column \"{0}\"")]
    UnknownColumn(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a [`crate::SecretStore`].
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret \"{0}\" not found")]
    NotFound(String),

    #[error("Data corruption detected in secret \"{0}\"")]
    DataCorruption(String),

    #[error("{backend} error: {message}")]
    Backend { backend: String, message: String },

    #[error("You must enable the `google` or `amazon` feature")]
    NoBackend,
}

impl SecretError {
    pub fn backend(backend: &str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type SecretResult<T> = std::result::Result<T, SecretError>;
