//! Signed AWS JSON-protocol client.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use rand::Rng;
use reqwest::Client;
use url::Url;

use crate::config::{AwsCredentials, AwsRegion, RetryConfig};
use crate::error::{AwsError, AwsResult};
use crate::signing::SigV4Signer;

const USER_AGENT: &str = concat!("stormware/", env!("CARGO_PKG_VERSION"), " aws-client");

/// Handles signing, retries and HTTP for every AWS call.
#[derive(Debug, Clone)]
pub struct AwsClient {
    http: Client,
    credentials: AwsCredentials,
    region: AwsRegion,
    retry_config: RetryConfig,
    /// Custom endpoint URL (LocalStack, tests).
    endpoint_override: Option<String>,
}

/// Response from an AWS API call.
#[derive(Debug, Clone)]
pub struct AwsResponse {
    pub status: u16,
    pub body: String,
    pub request_id: Option<String>,
}

impl AwsResponse {
    pub fn json(&self, service: &str) -> AwsResult<serde_json::Value> {
        if self.body.trim().is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        serde_json::from_str(&self.body).map_err(|e| AwsError::parse_error(service, self.status, e))
    }
}

impl AwsClient {
    pub fn new(credentials: AwsCredentials, region: AwsRegion) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http,
            credentials,
            region,
            retry_config: RetryConfig::default(),
            endpoint_override: None,
        }
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint_override = endpoint;
        self
    }

    pub fn endpoint(&self, service: &str) -> String {
        match self.endpoint_override {
            Some(ref url) => url.clone(),
            None => self.region.endpoint(service),
        }
    }

    pub fn region(&self) -> &AwsRegion {
        &self.region
    }

    pub fn credentials(&self) -> &AwsCredentials {
        &self.credentials
    }

    /// POST a JSON-protocol request with `x-amz-target: {target}`.
    pub async fn json_request(
        &self,
        service: &str,
        target: &str,
        body: &serde_json::Value,
    ) -> AwsResult<AwsResponse> {
        let endpoint = self.endpoint(service);
        let url = Url::parse(&endpoint)
            .map_err(|e| AwsError::new(service, "InvalidEndpoint", &e.to_string(), 0))?;
        let body = body.to_string();

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host_header(&url));
        headers.insert(
            "content-type".to_string(),
            "application/x-amz-json-1.1".to_string(),
        );
        headers.insert("x-amz-target".to_string(), target.to_string());

        debug!("AWS {} {}", service, target);
        self.execute_with_retry(service, &url, headers, body).await
    }

    async fn execute_with_retry(
        &self,
        service: &str,
        url: &Url,
        headers: BTreeMap<String, String>,
        body: String,
    ) -> AwsResult<AwsResponse> {
        let max_attempts = self.retry_config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let error = match self.execute_signed(service, url, headers.clone(), &body).await {
                Ok(response) if (200..300).contains(&response.status) => return Ok(response),
                Ok(response) => AwsError::parse_json_error(service, response.status, &response.body)
                    .with_request_id(response.request_id),
                Err(e) => e,
            };

            attempt += 1;
            if !error.retryable || attempt >= max_attempts {
                return Err(error);
            }
            let delay = self.calculate_backoff(attempt - 1);
            warn!(
                "AWS {} retryable error (attempt {}/{}): {} - retrying in {}ms",
                service, attempt, max_attempts, error.code, delay
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    async fn execute_signed(
        &self,
        service: &str,
        url: &Url,
        mut headers: BTreeMap<String, String>,
        body: &str,
    ) -> AwsResult<AwsResponse> {
        SigV4Signer::new(&self.credentials, &self.region.name, service).sign(
            "POST",
            url,
            &mut headers,
            body.as_bytes(),
            Utc::now(),
        );

        let mut req = self.http.post(url.clone());
        for (key, value) in &headers {
            req = req.header(key.as_str(), value.as_str());
        }
        let resp = req
            .header("user-agent", USER_AGENT)
            .body(body.to_string())
            .send()
            .await?;

        let status = resp.status().as_u16();
        let request_id = resp
            .headers()
            .get("x-amzn-requestid")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await?;

        Ok(AwsResponse {
            status,
            body,
            request_id,
        })
    }

    /// Exponential backoff with full jitter.
    fn calculate_backoff(&self, attempt: u32) -> u64 {
        let exponential = self
            .retry_config
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let capped = exponential.min(self.retry_config.max_backoff_ms);
        rand::thread_rng().gen_range(0..=capped)
    }
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or("amazonaws.com");
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> AwsClient {
        AwsClient::new(AwsCredentials::new("AKID", "secret"), AwsRegion::new("eu-west-1"))
            .with_endpoint(Some(server.uri()))
            .with_retry_config(RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            })
    }

    #[test]
    fn host_header_keeps_port() {
        assert_eq!(
            host_header(&Url::parse("http://127.0.0.1:4566").unwrap()),
            "127.0.0.1:4566"
        );
        assert_eq!(
            host_header(&Url::parse("https://secretsmanager.eu-west-1.amazonaws.com").unwrap()),
            "secretsmanager.eu-west-1.amazonaws.com"
        );
    }

    #[test]
    fn backoff_is_capped() {
        let client = AwsClient::new(AwsCredentials::new("a", "b"), AwsRegion::default());
        for attempt in 0..10 {
            assert!(client.calculate_backoff(attempt) <= 20_000);
        }
    }

    #[tokio::test]
    async fn signs_and_targets() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", "secretsmanager.GetSecretValue"))
            .and(header("content-type", "application/x-amz-json-1.1"))
            .and(header_exists("authorization"))
            .and(header_exists("x-amz-date"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"SecretString":"value"}"#,
                "application/x-amz-json-1.1",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let response = client
            .json_request(
                "secretsmanager",
                "secretsmanager.GetSecretValue",
                &serde_json::json!({"SecretId": "k"}),
            )
            .await
            .unwrap();
        assert_eq!(response.json("secretsmanager").unwrap()["SecretString"], "value");
    }

    #[tokio::test]
    async fn retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_raw(
                r#"{"__type":"ServiceUnavailable","message":"busy"}"#,
                "application/x-amz-json-1.1",
            ))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/x-amz-json-1.1"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let response = client
            .json_request("secretsmanager", "secretsmanager.ListSecrets", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_raw(
                r#"{"__type":"ResourceNotFoundException","message":"missing"}"#,
                "application/x-amz-json-1.1",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client
            .json_request("secretsmanager", "secretsmanager.DescribeSecret", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
