//! AWS error type.
//!
//! JSON-protocol services answer failures with a body such as
//! `{"__type": "ResourceNotFoundException", "message": "..."}`. [`AwsError`]
//! keeps the parsed code next to the HTTP status so callers can branch on
//! the code and the client can decide whether to retry.

use std::fmt;

use stormware_core::{SecretError, SecretResult};

/// Top-level error type for all AWS operations.
#[derive(Debug, Clone)]
pub struct AwsError {
    /// The AWS error code (e.g. "ResourceNotFoundException").
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// HTTP status code, 0 when the request never completed.
    pub status_code: u16,
    /// `x-amzn-RequestId` of the failing call.
    pub request_id: Option<String>,
    /// The AWS service that returned the error.
    pub service: String,
    /// Whether this error is retryable.
    pub retryable: bool,
}

impl fmt::Display for AwsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AWS {} error [{}]: {} (HTTP {})",
            self.service, self.code, self.message, self.status_code
        )?;
        if let Some(ref req_id) = self.request_id {
            write!(f, " [RequestId: {}]", req_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for AwsError {}

impl AwsError {
    pub fn new(service: &str, code: &str, message: &str, status_code: u16) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            status_code,
            request_id: None,
            service: service.to_string(),
            retryable: Self::is_retryable_code(code, status_code),
        }
    }

    /// No usable credentials were found for a profile or the environment.
    pub fn credential_error(message: &str) -> Self {
        Self {
            code: "CredentialError".to_string(),
            message: message.to_string(),
            status_code: 401,
            request_id: None,
            service: "sts".to_string(),
            retryable: false,
        }
    }

    /// A response body could not be decoded.
    pub fn parse_error(service: &str, status_code: u16, err: impl fmt::Display) -> Self {
        Self::new(service, "ParseError", &err.to_string(), status_code)
    }

    pub fn with_request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.code == "ResourceNotFoundException"
    }

    fn is_retryable_code(code: &str, status_code: u16) -> bool {
        if matches!(status_code, 429 | 500 | 502 | 503 | 504) {
            return true;
        }
        matches!(
            code,
            "Throttling"
                | "ThrottlingException"
                | "TooManyRequestsException"
                | "RequestLimitExceeded"
                | "LimitExceededException"
                | "InternalFailure"
                | "InternalServiceError"
                | "ServiceUnavailable"
                | "RequestTimeout"
                | "RequestTimeoutException"
        )
    }

    /// Parse an AWS JSON error response.
    ///
    /// `__type` may carry a namespace (`com.amazonaws.secretsmanager#...`),
    /// which is stripped.
    pub fn parse_json_error(service: &str, status_code: u16, body: &str) -> Self {
        let Ok(val) = serde_json::from_str::<serde_json::Value>(body) else {
            let excerpt: String = body.chars().take(200).collect();
            return Self::new(
                service,
                "UnknownError",
                &format!("HTTP {} from {}: {}", status_code, service, excerpt),
                status_code,
            );
        };
        let code = val
            .get("__type")
            .or_else(|| val.get("code"))
            .or_else(|| val.get("Code"))
            .and_then(|v| v.as_str())
            .map(|s| s.rsplit('#').next().unwrap_or(s).to_string())
            .unwrap_or_else(|| "UnknownError".to_string());
        let message = val
            .get("message")
            .or_else(|| val.get("Message"))
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown error");
        Self::new(service, &code, message, status_code)
    }

    /// Map onto the shared secret-store error for `key`.
    pub fn into_secret_error(self, key: &str) -> SecretError {
        if self.is_not_found() {
            SecretError::NotFound(key.to_string())
        } else {
            SecretError::backend("AWS Secrets Manager", self.to_string())
        }
    }
}

impl From<reqwest::Error> for AwsError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            code: "HttpError".to_string(),
            message: err.to_string(),
            status_code: err.status().map(|s| s.as_u16()).unwrap_or(0),
            request_id: None,
            service: "http".to_string(),
            retryable: err.is_timeout() || err.is_connect(),
        }
    }
}

impl From<stormware_core::Error> for AwsError {
    fn from(err: stormware_core::Error) -> Self {
        Self::new("stormware", "ConfigurationError", &err.to_string(), 0)
    }
}

/// Convenience result type for AWS operations.
pub type AwsResult<T> = Result<T, AwsError>;

pub(crate) fn secret_result<T>(result: AwsResult<T>, key: &str) -> SecretResult<T> {
    result.map_err(|e| e.into_secret_error(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_request_id() {
        let err = AwsError::new("secretsmanager", "AccessDeniedException", "nope", 400)
            .with_request_id(Some("req-1".into()));
        let s = err.to_string();
        assert!(s.contains("secretsmanager"));
        assert!(s.contains("AccessDeniedException"));
        assert!(s.contains("req-1"));
    }

    #[test]
    fn parse_namespaced_type() {
        let body = r#"{"__type":"com.amazonaws.secretsmanager#ResourceNotFoundException","message":"Secrets Manager can't find the specified secret."}"#;
        let err = AwsError::parse_json_error("secretsmanager", 400, body);
        assert_eq!(err.code, "ResourceNotFoundException");
        assert!(err.is_not_found());
        assert!(!err.retryable);
    }

    #[test]
    fn parse_garbage_body() {
        let err = AwsError::parse_json_error("secretsmanager", 502, "<html>bad gateway</html>");
        assert_eq!(err.code, "UnknownError");
        assert!(err.retryable);
    }

    #[test]
    fn throttling_is_retryable() {
        assert!(AwsError::new("secretsmanager", "ThrottlingException", "slow down", 400).retryable);
    }

    #[test]
    fn secret_error_mapping() {
        let missing = AwsError::new("secretsmanager", "ResourceNotFoundException", "gone", 400);
        assert!(missing.into_secret_error("k").is_not_found());
        let denied = AwsError::new("secretsmanager", "AccessDeniedException", "no", 400);
        assert!(!denied.into_secret_error("k").is_not_found());
    }
}
