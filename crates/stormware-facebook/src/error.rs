//! Error type for the Facebook Ads connector.
//!
//! Graph API failures arrive as
//! `{"error": {"message", "type", "code", "fbtrace_id"}}`.

use std::fmt;

use serde::Deserialize;

use stormware_core::SecretError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacebookErrorKind {
    /// Missing or unknown ad account, bad report arguments.
    InvalidArgument,
    NotFound,
    /// Credentials secret missing or malformed.
    Credentials,
    /// Graph API error (HTTP status).
    Api(u16),
    Network,
    Parse,
}

impl fmt::Display for FacebookErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "InvalidArgument"),
            Self::NotFound => write!(f, "NotFound"),
            Self::Credentials => write!(f, "Credentials"),
            Self::Api(code) => write!(f, "HTTP {}", code),
            Self::Network => write!(f, "Network"),
            Self::Parse => write!(f, "Parse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FacebookError {
    pub kind: FacebookErrorKind,
    pub message: String,
    /// Graph API error code (e.g. 190 for an invalid access token).
    pub api_code: Option<i64>,
    pub retryable: bool,
}

impl fmt::Display for FacebookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FacebookErrorKind::Api(status) => match self.api_code {
                Some(code) => write!(f, "Graph API error {} (HTTP {}): {}", code, status, self.message),
                None => write!(f, "Graph API error (HTTP {}): {}", status, self.message),
            },
            _ => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for FacebookError {}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    message: String,
    code: Option<i64>,
}

impl FacebookError {
    pub fn new(kind: FacebookErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            api_code: None,
            retryable: false,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(FacebookErrorKind::InvalidArgument, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(FacebookErrorKind::NotFound, msg)
    }

    pub fn parse(err: impl fmt::Display) -> Self {
        Self::new(FacebookErrorKind::Parse, format!("Failed to parse response: {}", err))
    }

    /// Build from a non-2xx Graph API response.
    pub fn from_response(status: u16, body: &str) -> Self {
        let (message, api_code) = match serde_json::from_str::<GraphErrorBody>(body) {
            Ok(parsed) => (parsed.error.message, parsed.error.code),
            Err(_) => (body.chars().take(500).collect(), None),
        };
        Self {
            kind: FacebookErrorKind::Api(status),
            message,
            api_code,
            retryable: matches!(status, 429 | 500..=599),
        }
    }
}

impl From<reqwest::Error> for FacebookError {
    fn from(e: reqwest::Error) -> Self {
        let mut err = Self::new(FacebookErrorKind::Network, e.to_string());
        err.retryable = e.is_timeout() || e.is_connect();
        err
    }
}

impl From<SecretError> for FacebookError {
    fn from(e: SecretError) -> Self {
        Self::new(FacebookErrorKind::Credentials, e.to_string())
    }
}

pub type FacebookResult<T> = Result<T, FacebookError>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_graph_errors() {
        let body = r#"{"error":{"message":"Invalid OAuth access token.","type":"OAuthException","code":190,"fbtrace_id":"A1"}}"#;
        let err = FacebookError::from_response(400, body);
        assert_eq!(err.kind, FacebookErrorKind::Api(400));
        assert_eq!(err.api_code, Some(190));
        assert!(!err.retryable);
        assert_eq!(
            err.to_string(),
            "Graph API error 190 (HTTP 400): Invalid OAuth access token."
        );
    }

    #[test]
    fn unparseable_body_is_kept() {
        let err = FacebookError::from_response(503, "upstream unavailable");
        assert!(err.retryable);
        assert_eq!(err.message, "upstream unavailable");
    }

    #[test]
    fn secret_errors_are_credential_errors() {
        let err: FacebookError = SecretError::NotFound("stormware-facebook".into()).into();
        assert_eq!(err.kind, FacebookErrorKind::Credentials);
    }
}
