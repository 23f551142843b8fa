//! Facebook Ads insights over the Graph API.
//!
//! Credentials live in the secret store as a JSON object with the `app_id`,
//! `app_secret` and `access_token` keys. Use a system user token; the system
//! user needs access to the ad accounts and must be an app tester.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::NaiveDate;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use stormware_core::{Cell, SecretStore, Table};

use crate::error::{FacebookError, FacebookErrorKind, FacebookResult};

pub const GRAPH_API_VERSION: &str = "v19.0";
pub const GRAPH_URL: &str = "https://graph.facebook.com";
pub const DEFAULT_SECRET_KEY: &str = "stormware-facebook";

const DATE_COLUMNS: [&str; 2] = ["date_start", "date_stop"];

#[derive(Clone, Serialize, Deserialize)]
pub struct FacebookCredentials {
    pub app_id: String,
    pub app_secret: String,
    pub access_token: String,
}

impl std::fmt::Debug for FacebookCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacebookCredentials")
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

impl FacebookCredentials {
    /// HMAC-SHA256 of the access token keyed by the app secret, hex encoded.
    pub fn appsecret_proof(&self) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.app_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(self.access_token.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Arguments of [`FacebookAds::report`].
#[derive(Debug, Clone, Default)]
pub struct ReportRequest {
    /// Numeric insight fields.
    pub metrics: Vec<String>,
    /// Dimensional insight fields.
    pub dimensions: Vec<String>,
    /// Ads action statistics fields (lists of `{action_type, value}`).
    pub statistics: Vec<String>,
    /// Insight parameters. Non-string values are sent JSON encoded.
    pub parameters: BTreeMap<String, Value>,
    pub account_name: Option<String>,
    /// Takes precedence over `account_name`.
    pub account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdAccount {
    id: String,
    #[serde(default)]
    name: String,
}

// ── Connector ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FacebookAds {
    http: reqwest::Client,
    base_url: String,
    credentials: FacebookCredentials,
    account_name: Option<String>,
    ad_accounts: BTreeMap<String, String>,
    max_retries: u32,
    backoff_ms: u64,
}

impl FacebookAds {
    pub fn new(credentials: FacebookCredentials, account_name: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("stormware/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: format!("{}/{}", GRAPH_URL, GRAPH_API_VERSION),
            credentials,
            account_name,
            ad_accounts: BTreeMap::new(),
            max_retries: 3,
            backoff_ms: 500,
        }
    }

    /// Load the credentials from `store` and the assigned ad accounts.
    pub async fn connect(
        store: &dyn SecretStore,
        secret_key: &str,
        account_name: Option<String>,
    ) -> FacebookResult<Self> {
        let raw = store.get(secret_key).await?;
        let credentials: FacebookCredentials = serde_json::from_str(&raw).map_err(|e| {
            FacebookError::new(
                FacebookErrorKind::Credentials,
                format!("Invalid Facebook credentials in secret \"{}\": {}", secret_key, e),
            )
        })?;
        let mut ads = Self::new(credentials, account_name);
        ads.load_accounts().await?;
        Ok(ads)
    }

    /// Graph API base including the version, e.g. for a local mock.
    pub fn with_endpoint(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.backoff_ms = backoff_ms;
        self
    }

    /// Ad account name → ID.
    pub fn accounts(&self) -> &BTreeMap<String, String> {
        &self.ad_accounts
    }

    pub async fn load_accounts(&mut self) -> FacebookResult<()> {
        info!("Loading Facebook Ads accounts");
        let rows = self
            .get_all_pages("me/assigned_ad_accounts", &[("fields", "id,name".to_string())])
            .await?;
        self.ad_accounts = rows
            .into_iter()
            .map(serde_json::from_value::<AdAccount>)
            .map(|a| a.map(|a| (a.name, a.id)))
            .collect::<Result<_, _>>()
            .map_err(FacebookError::parse)?;
        debug!("Loaded {} ad accounts", self.ad_accounts.len());
        Ok(())
    }

    pub fn account_id(&self, account_name: Option<&str>) -> FacebookResult<String> {
        let name = account_name
            .or(self.account_name.as_deref())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| FacebookError::invalid("You must specify the account"))?;
        self.ad_accounts.get(name).cloned().ok_or_else(|| {
            FacebookError::not_found(format!("Account \"{}\" not found in your accounts", name))
        })
    }

    // ── HTTP ────────────────────────────────────────────────────────

    async fn execute_with_retry(&self, url: &str, query: &[(&str, String)]) -> FacebookResult<Page> {
        let mut attempt = 0u32;
        loop {
            let resp = self.http.get(url).query(query).send().await;

            let result = match resp {
                Ok(resp) if resp.status().is_success() => {
                    let text = resp.text().await?;
                    return serde_json::from_str(&text).map_err(FacebookError::parse);
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    FacebookError::from_response(status, &body)
                }
                Err(e) => FacebookError::from(e),
            };

            if !result.retryable || attempt >= self.max_retries {
                return Err(result);
            }
            attempt += 1;
            let delay = self.backoff_ms * 2u64.pow(attempt - 1);
            warn!("Graph API request failed ({}), retry {} in {}ms", result, attempt, delay);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Every row of a paged edge, following `paging.next`.
    ///
    /// `next` URLs already carry the token, the proof and the cursor.
    async fn get_all_pages(&self, edge: &str, query: &[(&str, String)]) -> FacebookResult<Vec<Value>> {
        let mut query = query.to_vec();
        query.push(("access_token", self.credentials.access_token.clone()));
        query.push(("appsecret_proof", self.credentials.appsecret_proof()));

        let mut rows = Vec::new();
        let mut page = self
            .execute_with_retry(&format!("{}/{}", self.base_url, edge), &query)
            .await?;
        loop {
            rows.append(&mut page.data);
            match page.paging.and_then(|p| p.next) {
                Some(next) => {
                    debug!("Loading next page of {}", edge);
                    page = self.execute_with_retry(&next, &[]).await?;
                }
                None => return Ok(rows),
            }
        }
    }

    // ── Reports ─────────────────────────────────────────────────────

    /// Insights of an ad account as a table.
    ///
    /// Metrics are numeric and `date_start`/`date_stop` are dates. Every
    /// statistic column also yields one `{column}:{action_type}` column per
    /// action type, 0 where a row lacks that type.
    pub async fn report(&self, request: &ReportRequest) -> FacebookResult<Table> {
        let account_id = match request.account_id {
            Some(ref id) => id.clone(),
            None => self.account_id(request.account_name.as_deref())?,
        };

        info!("Loading Facebook Ads report");
        let fields: Vec<&str> = request
            .dimensions
            .iter()
            .chain(&request.metrics)
            .chain(&request.statistics)
            .map(String::as_str)
            .collect();
        let mut query: Vec<(&str, String)> = vec![("fields", fields.join(","))];
        for (key, value) in &request.parameters {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            query.push((key.as_str(), value));
        }

        let rows = self
            .get_all_pages(&format!("{}/insights", account_id), &query)
            .await?;
        insights_table(request, &rows)
    }
}

// ── Insights → table ────────────────────────────────────────────────────

fn numeric(value: Option<&Value>, column: &str) -> FacebookResult<Cell> {
    let cell = match value {
        None | Some(Value::Null) => Cell::Null,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => Cell::Int(i),
            None => Cell::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Some(Value::String(s)) => match s.parse::<i64>() {
            Ok(i) => Cell::Int(i),
            Err(_) => Cell::Float(s.parse::<f64>().map_err(|_| {
                FacebookError::parse(format!("non-numeric value \"{}\" in column \"{}\"", s, column))
            })?),
        },
        Some(other) => {
            return Err(FacebookError::parse(format!(
                "non-numeric value {} in column \"{}\"",
                other, column
            )))
        }
    };
    Ok(cell)
}

fn text(value: Option<&Value>) -> Cell {
    match value {
        None | Some(Value::Null) => Cell::Null,
        Some(Value::String(s)) => Cell::Text(s.clone()),
        Some(other) => Cell::Text(other.to_string()),
    }
}

fn date(value: Option<&Value>, column: &str) -> FacebookResult<Cell> {
    match value.and_then(Value::as_str) {
        None => Ok(Cell::Null),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Cell::Date)
            .map_err(|e| FacebookError::parse(format!("column \"{}\": {}", column, e))),
    }
}

fn actions(row: &Value, column: &str) -> Vec<Value> {
    row.get(column)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

pub(crate) fn insights_table(request: &ReportRequest, rows: &[Value]) -> FacebookResult<Table> {
    // Requested fields first, then whatever else the API returned.
    let mut columns: Vec<String> = Vec::new();
    for field in request
        .dimensions
        .iter()
        .chain(&request.metrics)
        .chain(&request.statistics)
    {
        if !columns.contains(field) {
            columns.push(field.clone());
        }
    }
    let extra: BTreeSet<&String> = rows
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|o| o.keys())
        .filter(|k| !columns.contains(*k))
        .collect();
    let mut extra: Vec<String> = extra.into_iter().cloned().collect();
    extra.sort_by_key(|k| !DATE_COLUMNS.contains(&k.as_str()));
    columns.extend(extra);

    let action_columns: Vec<(String, String, String)> = request
        .statistics
        .iter()
        .flat_map(|column| {
            let types: BTreeSet<String> = rows
                .iter()
                .flat_map(|row| actions(row, column))
                .filter_map(|a| a.get("action_type").and_then(Value::as_str).map(str::to_string))
                .collect();
            types
                .into_iter()
                .map(move |t| (format!("{}:{}", column, t), column.clone(), t))
        })
        .collect();

    let mut table = Table::new(
        columns
            .iter()
            .cloned()
            .chain(action_columns.iter().map(|(name, _, _)| name.clone())),
    );

    for row in rows {
        let mut cells = Vec::with_capacity(table.width());
        for column in &columns {
            let value = row.get(column);
            let cell = if request.metrics.contains(column) {
                numeric(value, column)?
            } else if DATE_COLUMNS.contains(&column.as_str()) {
                date(value, column)?
            } else {
                text(value)
            };
            cells.push(cell);
        }
        for (name, column, action_type) in &action_columns {
            let value = actions(row, column)
                .into_iter()
                .find(|a| a.get("action_type").and_then(Value::as_str) == Some(action_type.as_str()))
                .and_then(|a| a.get("value").cloned());
            cells.push(match value {
                Some(v) => numeric(Some(&v), name)?,
                None => Cell::Int(0),
            });
        }
        table
            .push_row(cells)
            .map_err(|e| FacebookError::parse(e.to_string()))?;
    }
    Ok(table)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stormware_core::MemorySecretStore;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> FacebookCredentials {
        FacebookCredentials {
            app_id: "1234".into(),
            app_secret: "app-secret".into(),
            access_token: "EAAB-token".into(),
        }
    }

    fn ads(server: &MockServer) -> FacebookAds {
        FacebookAds::new(credentials(), Some("Main".into()))
            .with_endpoint(&format!("{}/v19.0", server.uri()))
            .with_retry(0, 1)
    }

    async fn mount_accounts(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/v19.0/me/assigned_ad_accounts"))
            .and(query_param("fields", "id,name"))
            .and(query_param("access_token", "EAAB-token"))
            .and(query_param("appsecret_proof", credentials().appsecret_proof()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "act_1", "name": "Main"}],
                "paging": {"next": format!("{}/v19.0/me/assigned_ad_accounts?after=c1", server.uri())},
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v19.0/me/assigned_ad_accounts"))
            .and(query_param("after", "c1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "act_2", "name": "Other"}],
                "paging": {},
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn appsecret_proof_is_hmac_sha256_hex() {
        let proof = credentials().appsecret_proof();
        assert_eq!(proof.len(), 64);
        assert!(proof.chars().all(|c| c.is_ascii_hexdigit()));
        let other = FacebookCredentials {
            app_secret: "different".into(),
            ..credentials()
        };
        assert_ne!(proof, other.appsecret_proof());
    }

    #[test]
    fn credentials_debug_hides_secrets() {
        let debug = format!("{:?}", credentials());
        assert!(!debug.contains("app-secret"));
        assert!(!debug.contains("EAAB-token"));
    }

    #[tokio::test]
    async fn loads_accounts_across_pages() {
        let server = MockServer::start().await;
        mount_accounts(&server).await;

        let mut ads = ads(&server);
        ads.load_accounts().await.unwrap();
        assert_eq!(ads.accounts().len(), 2);
        assert_eq!(ads.account_id(None).unwrap(), "act_1");
        assert_eq!(ads.account_id(Some("Other")).unwrap(), "act_2");
        assert_eq!(
            ads.account_id(Some("Nope")).unwrap_err().to_string(),
            "Account \"Nope\" not found in your accounts"
        );

        let unnamed = FacebookAds::new(credentials(), None);
        assert_eq!(
            unnamed.account_id(None).unwrap_err().to_string(),
            "You must specify the account"
        );
    }

    #[tokio::test]
    async fn connect_reads_secret() {
        let store = MemorySecretStore::new().with_secret("fb", "not json");
        let err = FacebookAds::connect(&store, "fb", None).await.unwrap_err();
        assert_eq!(err.kind, FacebookErrorKind::Credentials);

        let err = FacebookAds::connect(&store, "missing", None).await.unwrap_err();
        assert_eq!(err.kind, FacebookErrorKind::Credentials);
    }

    #[tokio::test]
    async fn graph_errors_surface() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "Invalid OAuth access token.", "type": "OAuthException", "code": 190}
            })))
            .mount(&server)
            .await;

        let err = ads(&server).load_accounts().await.unwrap_err();
        assert_eq!(err.kind, FacebookErrorKind::Api(400));
        assert_eq!(err.api_code, Some(190));
    }

    #[tokio::test]
    async fn report_builds_typed_table() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v19.0/act_9/insights"))
            .and(query_param("fields", "campaign_name,spend,clicks,actions"))
            .and(query_param("level", "campaign"))
            .and(query_param("time_range", r#"{"since":"2024-03-01","until":"2024-03-02"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {
                        "campaign_name": "Spring",
                        "spend": "12.5",
                        "clicks": "40",
                        "actions": [
                            {"action_type": "purchase", "value": "2"},
                            {"action_type": "link_click", "value": "38"},
                        ],
                        "date_start": "2024-03-01",
                        "date_stop": "2024-03-01",
                    },
                    {
                        "campaign_name": "Brand",
                        "spend": "3",
                        "clicks": "7",
                        "date_start": "2024-03-02",
                        "date_stop": "2024-03-02",
                    },
                ],
            })))
            .mount(&server)
            .await;

        let mut parameters = BTreeMap::new();
        parameters.insert("level".to_string(), json!("campaign"));
        parameters.insert(
            "time_range".to_string(),
            json!({"since": "2024-03-01", "until": "2024-03-02"}),
        );
        let request = ReportRequest {
            metrics: vec!["spend".into(), "clicks".into()],
            dimensions: vec!["campaign_name".into()],
            statistics: vec!["actions".into()],
            parameters,
            account_name: Some("ignored".into()),
            account_id: Some("act_9".into()),
        };

        let table = ads(&server).report(&request).await.unwrap();
        assert_eq!(
            table.columns(),
            [
                "campaign_name",
                "spend",
                "clicks",
                "actions",
                "date_start",
                "date_stop",
                "actions:link_click",
                "actions:purchase",
            ]
        );
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let first = &table.rows()[0];
        assert_eq!(first[0], Cell::Text("Spring".into()));
        assert_eq!(first[1], Cell::Float(12.5));
        assert_eq!(first[2], Cell::Int(40));
        assert_eq!(first[4], Cell::Date(day));
        assert_eq!(first[6], Cell::Int(38));
        assert_eq!(first[7], Cell::Int(2));
        let second = &table.rows()[1];
        assert_eq!(second[1], Cell::Int(3));
        assert_eq!(second[3], Cell::Null);
        assert_eq!(second[6], Cell::Int(0));
        assert_eq!(second[7], Cell::Int(0));
    }

    #[test]
    fn non_numeric_metric_is_an_error() {
        let request = ReportRequest {
            metrics: vec!["spend".into()],
            ..Default::default()
        };
        let err = insights_table(&request, &[json!({"spend": "n/a"})]).unwrap_err();
        assert_eq!(err.kind, FacebookErrorKind::Parse);
    }
}
