//! GCP error types following Google Cloud API error conventions.
//!
//! Google Cloud APIs return errors as `{"error": {"code", "message",
//! "status"}}`, while the OAuth token endpoints answer with
//! `{"error": "invalid_grant", "error_description": "..."}`. Both are folded
//! into [`GcpError`].

use std::fmt;

use serde::Deserialize;

use stormware_core::SecretError;

/// `status` of token endpoint rejections that require a new authorization.
pub const INVALID_GRANT: &str = "INVALID_GRANT";

#[derive(Debug, Clone)]
pub struct GcpError {
    /// HTTP status code, 0 when the request never completed.
    pub code: u16,
    pub message: String,
    /// gRPC style status string (e.g. "NOT_FOUND", "PERMISSION_DENIED").
    pub status: String,
    /// The service that returned the error (e.g. "bigquery", "auth").
    pub service: String,
    /// Whether this error is retryable (429, 5xx).
    pub retryable: bool,
}

impl fmt::Display for GcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == 0 {
            return write!(f, "{}", self.message);
        }
        write!(
            f,
            "GCP {} error [{}]: {} (HTTP {})",
            self.service, self.status, self.message, self.code
        )
    }
}

impl std::error::Error for GcpError {}

impl GcpError {
    pub fn new(service: &str, code: u16, status: &str, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
            status: status.to_string(),
            service: service.to_string(),
            retryable: matches!(code, 429 | 500 | 502 | 503 | 504),
        }
    }

    /// Local failure with no HTTP exchange behind it.
    pub fn local(service: &str, status: &str, message: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: message.into(),
            status: status.to_string(),
            service: service.to_string(),
            retryable: false,
        }
    }

    pub fn auth_error(message: impl Into<String>) -> Self {
        Self::local("auth", "UNAUTHENTICATED", message)
    }

    pub fn invalid(service: &str, message: impl Into<String>) -> Self {
        Self::local(service, "INVALID_ARGUMENT", message)
    }

    pub fn parse(service: &str, err: impl fmt::Display) -> Self {
        Self::local(service, "PARSE_ERROR", format!("Failed to parse response: {}", err))
    }

    pub fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::local("io", "IO_ERROR", format!("\"{}\": {}", path.display(), err))
    }

    pub fn not_interactive() -> Self {
        Self::auth_error("Cannot run the OAuth flow: not an interactive session")
    }

    pub fn invalid_email(expected: &str, actual: &str) -> Self {
        Self::auth_error(format!(
            "Invalid email address \"{}\" (expected \"{}\")",
            actual, expected
        ))
    }

    /// Parse an API error body.
    pub fn from_api_response(service: &str, status_code: u16, body: &str) -> Self {
        #[derive(Deserialize)]
        struct ApiErrorInner {
            code: Option<u16>,
            message: Option<String>,
            status: Option<String>,
        }
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum ErrorField {
            Api(ApiErrorInner),
            OAuth(String),
        }
        #[derive(Deserialize)]
        struct ApiErrorWrapper {
            error: Option<ErrorField>,
            error_description: Option<String>,
        }

        match serde_json::from_str::<ApiErrorWrapper>(body) {
            Ok(ApiErrorWrapper {
                error: Some(ErrorField::Api(err)),
                ..
            }) => Self::new(
                service,
                err.code.unwrap_or(status_code),
                err.status.as_deref().unwrap_or("UNKNOWN"),
                err.message.as_deref().unwrap_or("Unknown error"),
            ),
            Ok(ApiErrorWrapper {
                error: Some(ErrorField::OAuth(kind)),
                error_description,
            }) => {
                let message = match error_description {
                    Some(description) => format!("{}: {}", kind, description),
                    None => kind.clone(),
                };
                Self::new(service, status_code, &kind.to_uppercase(), &message)
            }
            _ => Self::new(
                service,
                status_code,
                "UNKNOWN",
                &if body.is_empty() {
                    format!("HTTP {}", status_code)
                } else {
                    body.chars().take(500).collect::<String>()
                },
            ),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code == 404 || self.status == "NOT_FOUND"
    }

    /// The refresh token or assertion was rejected.
    pub fn is_invalid_grant(&self) -> bool {
        self.status == INVALID_GRANT
    }

    /// Map onto the shared secret-store error for `key`.
    pub fn into_secret_error(self, key: &str) -> SecretError {
        if self.is_not_found() {
            SecretError::NotFound(key.to_string())
        } else {
            SecretError::backend("Google Secret Manager", self.to_string())
        }
    }
}

impl From<reqwest::Error> for GcpError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            code: err.status().map(|s| s.as_u16()).unwrap_or(0),
            message: format!("Request failed: {}", err),
            status: "UNAVAILABLE".to_string(),
            service: "http".to_string(),
            retryable: err.is_timeout() || err.is_connect(),
        }
    }
}

impl From<stormware_core::Error> for GcpError {
    fn from(err: stormware_core::Error) -> Self {
        Self::local("stormware", "FAILED_PRECONDITION", err.to_string())
    }
}

impl From<SecretError> for GcpError {
    fn from(err: SecretError) -> Self {
        let status = if err.is_not_found() { "NOT_FOUND" } else { "INTERNAL" };
        Self::local("secrets", status, err.to_string())
    }
}

pub type GcpResult<T> = Result<T, GcpError>;
