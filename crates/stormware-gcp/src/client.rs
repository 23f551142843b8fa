//! Base Google API HTTP client.
//!
//! All Google REST APIs follow a consistent pattern:
//! - Base URL: `https://{service}.googleapis.com` (Drive: `https://www.googleapis.com`)
//! - Auth: `Authorization: Bearer {access_token}`
//! - Request/Response: JSON
//! - Pagination: `pageToken` / `nextPageToken`
//!
//! This client handles token acquisition, quota project, retries and error
//! parsing.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::credentials::{http_client, Credentials};
use crate::error::{GcpError, GcpResult};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_MS: u64 = 500;

/// Bearer-token JSON client bound to one set of credentials.
#[derive(Debug, Clone)]
pub struct GcpClient {
    http: Client,
    credentials: Arc<Credentials>,
    endpoint_override: Option<String>,
    max_retries: u32,
    backoff_ms: u64,
}

impl GcpClient {
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self {
            http: http_client(),
            credentials,
            endpoint_override: None,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }

    /// Send every request to `endpoint` instead of the service root.
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint_override = endpoint.map(|e| e.trim_end_matches('/').to_string());
        self
    }

    /// Retry transient failures `max_retries` times, starting at
    /// `backoff_ms` and doubling.
    pub fn with_retry(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    /// Build the base URL for a service.
    pub fn base_url(&self, service: &str) -> String {
        match self.endpoint_override {
            Some(ref url) => url.clone(),
            None if service == "drive" => "https://www.googleapis.com".to_string(),
            None => format!("https://{}.googleapis.com", service),
        }
    }

    fn url(&self, service: &str, path: &str) -> String {
        format!("{}{}", self.base_url(service), path)
    }

    // ── Request execution ───────────────────────────────────────────

    async fn execute_with_retry(
        &self,
        service: &str,
        build_fn: impl Fn() -> RequestBuilder,
    ) -> GcpResult<Response> {
        let mut attempt = 0u32;
        let mut refreshed = false;
        loop {
            let token = self.credentials.access_token().await?;
            let mut builder = build_fn().bearer_auth(&token);
            if let Some(project) = self.credentials.quota_project_id() {
                builder = builder.header("x-goog-user-project", project);
            }
            let request = builder.build()?;
            debug!("{} API {} {}", service, request.method(), request.url());

            let error = match self.http.execute(request).await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if status == StatusCode::UNAUTHORIZED && !refreshed {
                        debug!("{} API rejected the access token, refreshing", service);
                        refreshed = true;
                        self.credentials.refresh().await?;
                        continue;
                    }
                    GcpError::from_api_response(service, status.as_u16(), &body)
                }
                Err(e) => GcpError::from(e),
            };

            if !error.retryable || attempt >= self.max_retries {
                return Err(error);
            }
            attempt += 1;
            let backoff = Duration::from_millis(self.backoff_ms * 2u64.pow(attempt - 1));
            warn!(
                "{} API transient error ({}), retry {}/{} in {:?}",
                service, error.code, attempt, self.max_retries, backoff
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn send(
        &self,
        service: &str,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> GcpResult<Response> {
        let url = self.url(service, path);
        self.execute_with_retry(service, || {
            let req = self.http.request(method.clone(), &url).query(query);
            match body {
                Some(ref bytes) => req
                    .header("Content-Type", "application/json")
                    .body(bytes.clone()),
                None => req,
            }
        })
        .await
    }

    async fn json_body<T: DeserializeOwned>(service: &str, resp: Response) -> GcpResult<T> {
        let text = resp.text().await?;
        let text = if text.trim().is_empty() { "{}" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| GcpError::parse(service, e))
    }

    fn encode<B: Serialize + ?Sized>(service: &str, body: &B) -> GcpResult<Vec<u8>> {
        serde_json::to_vec(body)
            .map_err(|e| GcpError::invalid(service, format!("Body serialization: {}", e)))
    }

    // ── Generic REST methods ────────────────────────────────────────

    /// GET a Google API URL and deserialize the JSON response.
    pub async fn get<T: DeserializeOwned>(
        &self,
        service: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> GcpResult<T> {
        let resp = self.send(service, Method::GET, path, query, None).await?;
        Self::json_body(service, resp).await
    }

    /// GET that returns the raw response body as a String.
    pub async fn get_text(
        &self,
        service: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> GcpResult<String> {
        let resp = self.send(service, Method::GET, path, query, None).await?;
        Ok(resp.text().await?)
    }

    /// GET that returns the raw response bytes (media downloads).
    pub async fn get_bytes(
        &self,
        service: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> GcpResult<Vec<u8>> {
        let resp = self.send(service, Method::GET, path, query, None).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// POST JSON to a Google API and deserialize the response.
    pub async fn post<B, T>(
        &self,
        service: &str,
        path: &str,
        query: &[(&str, &str)],
        body: &B,
    ) -> GcpResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let bytes = Self::encode(service, body)?;
        let resp = self.send(service, Method::POST, path, query, Some(bytes)).await?;
        Self::json_body(service, resp).await
    }

    /// PUT JSON to a Google API.
    pub async fn put<B, T>(
        &self,
        service: &str,
        path: &str,
        query: &[(&str, &str)],
        body: &B,
    ) -> GcpResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let bytes = Self::encode(service, body)?;
        let resp = self.send(service, Method::PUT, path, query, Some(bytes)).await?;
        Self::json_body(service, resp).await
    }

    /// PATCH JSON to a Google API.
    pub async fn patch<B, T>(
        &self,
        service: &str,
        path: &str,
        query: &[(&str, &str)],
        body: &B,
    ) -> GcpResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let bytes = Self::encode(service, body)?;
        let resp = self.send(service, Method::PATCH, path, query, Some(bytes)).await?;
        Self::json_body(service, resp).await
    }

    /// DELETE a resource.
    pub async fn delete(&self, service: &str, path: &str, query: &[(&str, &str)]) -> GcpResult<()> {
        self.send(service, Method::DELETE, path, query, None).await?;
        Ok(())
    }

    /// POST a `multipart/related` upload: JSON metadata followed by media.
    pub async fn post_multipart_related<B, T>(
        &self,
        service: &str,
        path: &str,
        query: &[(&str, &str)],
        metadata: &B,
        media: &[u8],
        media_type: &str,
    ) -> GcpResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let boundary = format!("stormware_{}", uuid::Uuid::new_v4().simple());
        let body = multipart_related_body(&boundary, &Self::encode(service, metadata)?, media, media_type);
        let content_type = format!("multipart/related; boundary={}", boundary);
        let url = self.url(service, path);

        let resp = self
            .execute_with_retry(service, || {
                self.http
                    .post(&url)
                    .query(query)
                    .header("Content-Type", content_type.as_str())
                    .body(body.clone())
            })
            .await?;
        Self::json_body(service, resp).await
    }

    // ── Pagination helpers ──────────────────────────────────────────

    /// Fetch all pages of a paginated list endpoint, collecting the array
    /// under `items_key` of every page.
    pub async fn get_all_pages<T: DeserializeOwned>(
        &self,
        service: &str,
        path: &str,
        base_query: &[(&str, String)],
        items_key: &str,
    ) -> GcpResult<Vec<T>> {
        let mut all_items: Vec<T> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query: Vec<(&str, &str)> =
                base_query.iter().map(|(k, v)| (*k, v.as_str())).collect();
            if let Some(ref pt) = page_token {
                query.push(("pageToken", pt.as_str()));
            }

            let mut page: serde_json::Value = self.get(service, path, &query).await?;
            if let Some(items) = page.get_mut(items_key).map(serde_json::Value::take) {
                if !items.is_null() {
                    let items: Vec<T> =
                        serde_json::from_value(items).map_err(|e| GcpError::parse(service, e))?;
                    all_items.extend(items);
                }
            }

            page_token = page
                .get("nextPageToken")
                .and_then(|v| v.as_str())
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
            debug!("{} API fetching next page of {}", service, path);
        }

        Ok(all_items)
    }
}

fn multipart_related_body(boundary: &str, metadata: &[u8], media: &[u8], media_type: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + media.len() + 256);
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n",
            boundary
        )
        .as_bytes(),
    );
    body.extend_from_slice(metadata);
    body.extend_from_slice(format!("\r\n--{}\r\nContent-Type: {}\r\n\r\n", boundary, media_type).as_bytes());
    body.extend_from_slice(media);
    body.extend_from_slice(format!("\r\n--{}--", boundary).as_bytes());
    body
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GcpClient {
        let credentials = Credentials::from_access_token("ya29.test").with_quota_project("acme-proj");
        GcpClient::new(Arc::new(credentials))
            .with_endpoint(Some(server.uri()))
            .with_retry(2, 1)
    }

    #[test]
    fn service_roots() {
        let client = GcpClient::new(Arc::new(Credentials::from_access_token("t")));
        assert_eq!(client.base_url("bigquery"), "https://bigquery.googleapis.com");
        assert_eq!(client.base_url("drive"), "https://www.googleapis.com");
        let overridden = client.with_endpoint(Some("http://localhost:1/".into()));
        assert_eq!(overridden.base_url("drive"), "http://localhost:1");
    }

    #[test]
    fn multipart_layout() {
        let body = multipart_related_body("b", br#"{"name":"x"}"#, b"hello", "text/plain");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--b\r\nContent-Type: application/json"));
        assert!(text.contains("{\"name\":\"x\"}\r\n--b\r\nContent-Type: text/plain\r\n\r\nhello"));
        assert!(text.ends_with("\r\n--b--"));
    }

    #[tokio::test]
    async fn sends_bearer_and_quota_project() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/things"))
            .and(query_param("filter", "x"))
            .and(header("authorization", "Bearer ya29.test"))
            .and(header("x-goog-user-project", "acme-proj"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let value: serde_json::Value = client(&server)
            .get("things", "/v1/things", &[("filter", "x")])
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("\"a\":1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "1"})))
            .mount(&server)
            .await;

        let value: serde_json::Value = client(&server)
            .post("things", "/v1/things", &[], &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(value["id"], "1");
    }

    fn stale_user_credentials(server: &MockServer) -> Arc<Credentials> {
        let info = serde_json::json!({
            "type": "authorized_user",
            "client_id": "client.apps.googleusercontent.com",
            "client_secret": "shh",
            "refresh_token": "1//refresh",
            "token_uri": format!("{}/token", server.uri()),
            "token": "ya29.stale",
            "expiry": "2099-01-01T00:00:00Z",
        });
        Arc::new(Credentials::from_authorized_user_info(&info.to_string()).unwrap())
    }

    async fn mount_token_endpoint(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.fresh",
                "expires_in": 3599,
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn unauthorized_refreshes_once_and_retries() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/things"))
            .and(header("authorization", "Bearer ya29.stale"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"code": 401, "message": "expired", "status": "UNAUTHENTICATED"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/things"))
            .and(header("authorization", "Bearer ya29.fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = GcpClient::new(stale_user_credentials(&server))
            .with_endpoint(Some(server.uri()))
            .with_retry(0, 1);
        let value: serde_json::Value = client.get("things", "/v1/things", &[]).await.unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(client.credentials().access_token().await.unwrap(), "ya29.fresh");
    }

    #[tokio::test]
    async fn second_unauthorized_is_returned() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/things"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"code": 401, "message": "denied", "status": "UNAUTHENTICATED"}
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = GcpClient::new(stale_user_credentials(&server))
            .with_endpoint(Some(server.uri()))
            .with_retry(0, 1);
        let err = client
            .get::<serde_json::Value>("things", "/v1/things", &[])
            .await
            .unwrap_err();
        assert_eq!(err.code, 401);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": {"code": 404, "message": "missing", "status": "NOT_FOUND"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).delete("things", "/v1/things/1", &[]).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn pages_until_no_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/items"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [3]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [1, 2],
                "nextPageToken": "p2"
            })))
            .mount(&server)
            .await;

        let items: Vec<i64> = client(&server)
            .get_all_pages("things", "/v1/items", &[], "items")
            .await
            .unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }
}
