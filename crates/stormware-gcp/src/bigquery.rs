//! BigQuery table download and upload.
//!
//! API base: `https://bigquery.googleapis.com/bigquery/v2`

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Value};

use stormware_core::{Cell, ColumnType, Table};

use crate::auth::GcpAuth;
use crate::client::GcpClient;
use crate::error::{GcpError, GcpResult};

const SERVICE: &str = "bigquery";
const V2: &str = "/bigquery/v2";
const UPLOAD_V2: &str = "/upload/bigquery/v2";
const PAGE_SIZE: &str = "10000";

// ── Types ───────────────────────────────────────────────────────────────

/// Fully qualified table reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    /// Parse `dataset.table` or `project.dataset.table`.
    pub fn parse(name: &str, default_project: &str) -> GcpResult<Self> {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(GcpError::invalid(SERVICE, format!("Invalid table name \"{}\"", name)));
        }
        match parts.as_slice() {
            [dataset, table] => Ok(Self {
                project_id: default_project.to_string(),
                dataset_id: dataset.to_string(),
                table_id: table.to_string(),
            }),
            [project, dataset, table] => Ok(Self {
                project_id: project.to_string(),
                dataset_id: dataset.to_string(),
                table_id: table.to_string(),
            }),
            _ => Err(GcpError::invalid(SERVICE, format!("Invalid table name \"{}\"", name))),
        }
    }

    fn path(&self) -> String {
        format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            V2, self.project_id, self.dataset_id, self.table_id
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type", default)]
    field_type: String,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct TableResource {
    schema: Option<TableSchema>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableDataPage {
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

// ── BigQuery ────────────────────────────────────────────────────────────

/// BigQuery connector for one project.
#[derive(Debug, Clone)]
pub struct BigQuery {
    client: GcpClient,
    project_id: String,
    poll_interval: Duration,
    job_timeout: Duration,
}

impl BigQuery {
    pub fn new(client: GcpClient, project_id: &str) -> Self {
        Self {
            client,
            project_id: project_id.to_string(),
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(600),
        }
    }

    /// Connector using the resolved credentials and project ID.
    pub async fn connect(
        auth: &GcpAuth,
        organization: Option<&str>,
        project: Option<&str>,
    ) -> GcpResult<Self> {
        let client = auth.client(organization, project, &[]).await?;
        Ok(Self::new(client, &auth.project_id(organization, project)?))
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.job_timeout = timeout;
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Return the given table.
    pub async fn get_table(&self, name: &str) -> GcpResult<Table> {
        info!("Loading data from BigQuery table \"{}\"", name);
        let table_ref = TableRef::parse(name, &self.project_id)?;

        let resource: TableResource = self.client.get(SERVICE, &table_ref.path(), &[]).await?;
        let fields = resource.schema.map(|s| s.fields).unwrap_or_default();
        let mut table = Table::new(fields.iter().map(|f| f.name.clone()));

        let data_path = format!("{}/data", table_ref.path());
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("maxResults", PAGE_SIZE)];
            if let Some(ref token) = page_token {
                query.push(("pageToken", token.as_str()));
            }
            let page: TableDataPage = self.client.get(SERVICE, &data_path, &query).await?;
            for row in page.rows {
                let cells = fields
                    .iter()
                    .zip(row.f)
                    .map(|(field, cell)| convert_cell(&field.field_type, cell.v))
                    .collect::<GcpResult<Vec<Cell>>>()?;
                table.push_row(cells)?;
            }
            page_token = page.page_token.filter(|t| !t.is_empty());
            if page_token.is_none() {
                break;
            }
            debug!("Fetching next page of \"{}\"", name);
        }
        Ok(table)
    }

    /// Upload the given table, replacing the existing data.
    pub async fn set_table(&self, name: &str, data: &Table) -> GcpResult<()> {
        info!("Uploading data to BigQuery table \"{}\"", name);
        let table_ref = TableRef::parse(name, &self.project_id)?;
        let types = data.column_types();

        let fields: Vec<Value> = data
            .columns()
            .iter()
            .zip(&types)
            .map(|(name, column_type)| {
                json!({ "name": name, "type": schema_type(*column_type), "mode": "NULLABLE" })
            })
            .collect();
        let job = json!({
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": table_ref.project_id,
                        "datasetId": table_ref.dataset_id,
                        "tableId": table_ref.table_id,
                    },
                    "writeDisposition": "WRITE_TRUNCATE",
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "schema": { "fields": fields },
                }
            }
        });

        let path = format!("{}/projects/{}/jobs", UPLOAD_V2, self.project_id);
        let created: Value = self
            .client
            .post_multipart_related(
                SERVICE,
                &path,
                &[("uploadType", "multipart")],
                &job,
                &to_ndjson(data, &types)?,
                "application/octet-stream",
            )
            .await?;
        self.wait_for_job(&created).await
    }

    /// Poll a job until its state is `DONE`.
    async fn wait_for_job(&self, job: &Value) -> GcpResult<()> {
        let reference = &job["jobReference"];
        let job_id = reference["jobId"]
            .as_str()
            .ok_or_else(|| GcpError::parse(SERVICE, "job has no jobReference.jobId"))?;
        let project_id = reference["projectId"].as_str().unwrap_or(&self.project_id);
        let location = reference["location"].as_str().unwrap_or_default();
        let path = format!("{}/projects/{}/jobs/{}", V2, project_id, job_id);

        let started = tokio::time::Instant::now();
        let mut current = job.clone();
        loop {
            let status = &current["status"];
            if status["state"] == "DONE" {
                if let Some(message) = status["errorResult"]["message"].as_str() {
                    return Err(GcpError::new(SERVICE, 400, "JOB_FAILED", message));
                }
                debug!("BigQuery job \"{}\" done", job_id);
                return Ok(());
            }
            if started.elapsed() >= self.job_timeout {
                return Err(GcpError::new(
                    SERVICE,
                    408,
                    "DEADLINE_EXCEEDED",
                    "Job timed out waiting for completion",
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
            let mut query = Vec::new();
            if !location.is_empty() {
                query.push(("location", location));
            }
            current = self.client.get(SERVICE, &path, &query).await?;
        }
    }
}

// ── Conversion ──────────────────────────────────────────────────────────

fn convert_cell(field_type: &str, value: Value) -> GcpResult<Cell> {
    let text = match value {
        Value::Null => return Ok(Cell::Null),
        Value::String(s) => s,
        // Repeated and record fields.
        other => return Ok(Cell::Text(other.to_string())),
    };
    let invalid = |e: &dyn std::fmt::Display| {
        GcpError::parse(SERVICE, format!("invalid {} value \"{}\": {}", field_type, text, e))
    };
    Ok(match field_type {
        "INTEGER" | "INT64" => Cell::Int(text.parse().map_err(|e| invalid(&e))?),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => {
            Cell::Float(text.parse().map_err(|e| invalid(&e))?)
        }
        "BOOLEAN" | "BOOL" => Cell::Bool(text.eq_ignore_ascii_case("true")),
        "DATE" => Cell::Date(NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|e| invalid(&e))?),
        "DATETIME" => Cell::DateTime(
            NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f").map_err(|e| invalid(&e))?,
        ),
        "TIMESTAMP" => {
            let seconds: f64 = text.parse().map_err(|e| invalid(&e))?;
            let micros = (seconds * 1_000_000.0).round() as i64;
            let timestamp = DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| invalid(&"out of range"))?;
            Cell::DateTime(timestamp.naive_utc())
        }
        _ => Cell::Text(text),
    })
}

fn schema_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer => "INTEGER",
        ColumnType::Float => "FLOAT",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Date => "DATE",
        ColumnType::DateTime => "DATETIME",
        ColumnType::Text | ColumnType::Empty => "STRING",
    }
}

fn json_value(cell: &Cell, column_type: ColumnType) -> Value {
    match (cell, column_type) {
        (Cell::Null, _) => Value::Null,
        (Cell::Float(v), _) if !v.is_finite() => Value::Null,
        (_, ColumnType::Text) => Value::String(cell.to_string()),
        (Cell::Bool(v), _) => json!(v),
        (Cell::Int(v), _) => json!(v),
        (Cell::Float(v), _) => json!(v),
        (Cell::Text(v), _) => json!(v),
        (Cell::Date(v), _) => json!(v.format("%Y-%m-%d").to_string()),
        (Cell::DateTime(v), _) => json!(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
    }
}

/// One JSON object per row.
fn to_ndjson(data: &Table, types: &[ColumnType]) -> GcpResult<Vec<u8>> {
    let mut out = Vec::new();
    for row in data.rows() {
        let object: serde_json::Map<String, Value> = data
            .columns()
            .iter()
            .zip(row.iter().zip(types))
            .map(|(name, (cell, column_type))| (name.clone(), json_value(cell, *column_type)))
            .collect();
        serde_json::to_writer(&mut out, &object).map_err(|e| GcpError::parse(SERVICE, e))?;
        out.push(b'\n');
    }
    Ok(out)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use std::sync::Arc;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bigquery(server: &MockServer) -> BigQuery {
        let client = GcpClient::new(Arc::new(Credentials::from_access_token("ya29.test")))
            .with_endpoint(Some(server.uri()))
            .with_retry(0, 1);
        BigQuery::new(client, "stormware-example-org")
            .with_polling(Duration::from_millis(1), Duration::from_secs(5))
    }

    #[test]
    fn table_names() {
        let short = TableRef::parse("sales.daily", "p").unwrap();
        assert_eq!(short.project_id, "p");
        assert_eq!(short.table_id, "daily");
        let full = TableRef::parse("other.sales.daily", "p").unwrap();
        assert_eq!(full.project_id, "other");
        assert!(TableRef::parse("daily", "p").is_err());
        assert!(TableRef::parse("a..b", "p").is_err());
    }

    #[test]
    fn cell_conversion() {
        assert_eq!(convert_cell("INTEGER", json!("42")).unwrap(), Cell::Int(42));
        assert_eq!(convert_cell("NUMERIC", json!("1.5")).unwrap(), Cell::Float(1.5));
        assert_eq!(convert_cell("BOOL", json!("true")).unwrap(), Cell::Bool(true));
        assert_eq!(convert_cell("STRING", Value::Null).unwrap(), Cell::Null);
        assert_eq!(
            convert_cell("DATE", json!("2024-02-29")).unwrap(),
            Cell::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert_eq!(
            convert_cell("TIMESTAMP", json!("1.7E9")).unwrap(),
            Cell::DateTime(DateTime::from_timestamp(1_700_000_000, 0).unwrap().naive_utc())
        );
        assert_eq!(
            convert_cell("DATETIME", json!("2024-01-02T03:04:05.5")).unwrap().to_string(),
            "2024-01-02 03:04:05.500"
        );
        assert!(convert_cell("INTEGER", json!("x")).is_err());
    }

    #[test]
    fn ndjson_rows() {
        let mut table = Table::new(["id", "name", "day"]);
        table
            .push_row(vec![
                Cell::Int(1),
                Cell::Text("a".into()),
                Cell::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            ])
            .unwrap();
        table.push_row(vec![Cell::Null, Cell::Int(7), Cell::Null]).unwrap();
        let types = table.column_types();
        assert_eq!(types, vec![ColumnType::Integer, ColumnType::Text, ColumnType::Date]);

        let text = String::from_utf8(to_ndjson(&table, &types).unwrap()).unwrap();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines[0], json!({"id": 1, "name": "a", "day": "2024-01-01"}));
        assert_eq!(lines[1], json!({"id": null, "name": "7", "day": null}));
    }

    #[tokio::test]
    async fn get_table_pages_rows() {
        let server = MockServer::start().await;
        let table_path = "/bigquery/v2/projects/stormware-example-org/datasets/sales/tables/daily";
        Mock::given(method("GET"))
            .and(path(table_path))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "schema": {"fields": [
                    {"name": "id", "type": "INTEGER"},
                    {"name": "amount", "type": "FLOAT"},
                    {"name": "note", "type": "STRING"},
                ]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/data", table_path)))
            .and(query_param("pageToken", "next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rows": [{"f": [{"v": "2"}, {"v": null}, {"v": "b"}]}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/data", table_path)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalRows": "2",
                "pageToken": "next",
                "rows": [{"f": [{"v": "1"}, {"v": "9.5"}, {"v": "a"}]}]
            })))
            .mount(&server)
            .await;

        let table = bigquery(&server).get_table("sales.daily").await.unwrap();
        assert_eq!(table.columns(), ["id", "amount", "note"]);
        assert_eq!(table.height(), 2);
        assert_eq!(table.rows()[0], vec![Cell::Int(1), Cell::Float(9.5), Cell::Text("a".into())]);
        assert_eq!(table.rows()[1][1], Cell::Null);
    }

    #[tokio::test]
    async fn set_table_runs_load_job() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/stormware-example-org/jobs"))
            .and(query_param("uploadType", "multipart"))
            .and(body_string_contains("WRITE_TRUNCATE"))
            .and(body_string_contains("NEWLINE_DELIMITED_JSON"))
            .and(body_string_contains(r#"{"id":1}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"projectId": "stormware-example-org", "jobId": "job_1", "location": "EU"},
                "status": {"state": "RUNNING"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/stormware-example-org/jobs/job_1"))
            .and(query_param("location", "EU"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": {"state": "DONE"}
            })))
            .mount(&server)
            .await;

        let mut table = Table::new(["id"]);
        table.push_row(vec![Cell::Int(1)]).unwrap();
        bigquery(&server).set_table("sales.daily", &table).await.unwrap();
    }

    #[tokio::test]
    async fn set_table_surfaces_job_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"projectId": "stormware-example-org", "jobId": "job_2"},
                "status": {"state": "DONE", "errorResult": {"message": "Provided Schema does not match"}}
            })))
            .mount(&server)
            .await;

        let table = Table::new(["id"]);
        let err = bigquery(&server).set_table("sales.daily", &table).await.unwrap_err();
        assert_eq!(err.message, "Provided Schema does not match");
    }
}
