//! Google Sheets connector.
//!
//! API base: `https://sheets.googleapis.com/v4/spreadsheets`

use chrono::Timelike;
use log::{debug, info};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use stormware_core::{Cell, ColumnType, Table};
use stormware_gcp::{scopes, GcpAuth, GcpClient, GcpError, GcpResult};

const SERVICE: &str = "sheets";

// ── Request types ───────────────────────────────────────────────────────

/// `gridProperties` of a sheet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridProperties {
    pub row_count: usize,
    pub column_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen_row_count: Option<usize>,
}

/// A `GridRange`; unset bounds are unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridRange {
    pub sheet_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_row_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_row_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_column_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_column_index: Option<usize>,
}

impl GridRange {
    pub fn rows(sheet_id: i64, start: usize, end: usize) -> Self {
        Self {
            sheet_id,
            start_row_index: Some(start),
            end_row_index: Some(end),
            ..Default::default()
        }
    }

    pub fn columns(sheet_id: i64, start: usize, end: usize) -> Self {
        Self {
            sheet_id,
            start_column_index: Some(start),
            end_column_index: Some(end),
            ..Default::default()
        }
    }
}

/// `repeatCell` request applying `format` to every cell of `range`.
pub fn format_request(format: Value, range: GridRange) -> Value {
    let keys: Vec<&str> = format
        .as_object()
        .map(|o| o.keys().map(String::as_str).collect())
        .unwrap_or_default();
    let fields = format!("userEnteredFormat({})", keys.join(","));
    json!({
        "repeatCell": {
            "range": range,
            "cell": {"userEnteredFormat": format},
            "fields": fields,
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct Sheet {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetInfo {
    #[serde(default)]
    sheets: Vec<Sheet>,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

// ── Value conversion ────────────────────────────────────────────────────

fn cell_from_value(value: &Value) -> Cell {
    match value {
        Value::Null => Cell::Null,
        Value::Bool(b) => Cell::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Cell::Int(i),
            None => {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    Cell::Int(f as i64)
                } else {
                    Cell::Float(f)
                }
            }
        },
        Value::String(s) => Cell::Text(s.clone()),
        other => Cell::Text(other.to_string()),
    }
}

fn header_name(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => cell_from_value(other).to_string(),
    }
}

/// Cell rendering for a column written with `valueInputOption=RAW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Render {
    Plain,
    Date,
    DateTime { fractional: bool },
}

fn column_render(table: &Table, index: usize, column_type: ColumnType) -> Render {
    match column_type {
        ColumnType::Date => Render::Date,
        ColumnType::DateTime => Render::DateTime {
            fractional: table.rows().iter().any(|row| {
                matches!(row.get(index), Some(Cell::DateTime(dt)) if dt.nanosecond() != 0)
            }),
        },
        _ => Render::Plain,
    }
}

fn cell_value(cell: &Cell, render: Render) -> Value {
    match (cell, render) {
        (Cell::Null, _) => json!(""),
        (Cell::Bool(b), _) => json!(b),
        (Cell::Int(i), _) => json!(i),
        (Cell::Float(f), _) if f.is_finite() => json!(f),
        (Cell::Float(_), _) => json!(""),
        (Cell::Text(s), _) => json!(s),
        (Cell::Date(d), _) => json!(d.format("%Y-%m-%d").to_string()),
        (Cell::DateTime(dt), Render::DateTime { fractional: true }) => {
            json!(dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
        }
        (Cell::DateTime(dt), _) => json!(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
    }
}

/// Header row followed by the rendered data rows.
fn table_values(table: &Table) -> Vec<Vec<Value>> {
    let renders: Vec<Render> = table
        .column_types()
        .into_iter()
        .enumerate()
        .map(|(i, t)| column_render(table, i, t))
        .collect();
    let mut values = Vec::with_capacity(table.height() + 1);
    values.push(table.columns().iter().map(|c| json!(c)).collect());
    for row in table.rows() {
        values.push(
            row.iter()
                .zip(&renders)
                .map(|(cell, render)| cell_value(cell, *render))
                .collect(),
        );
    }
    values
}

// ── Spreadsheet ─────────────────────────────────────────────────────────

/// One spreadsheet, addressed by its key (the ID in the sheet URL).
///
/// The credentials must be authorized for the
/// `https://www.googleapis.com/auth/spreadsheets` scope.
#[derive(Debug, Clone)]
pub struct Spreadsheet {
    client: GcpClient,
    key: String,
}

impl Spreadsheet {
    pub fn new(client: GcpClient, key: &str) -> Self {
        Self {
            client,
            key: key.to_string(),
        }
    }

    pub async fn connect(
        auth: &GcpAuth,
        key: &str,
        organization: Option<&str>,
        project: Option<&str>,
    ) -> GcpResult<Self> {
        let client = auth
            .client(organization, project, &[scopes::SPREADSHEETS])
            .await?;
        Ok(Self::new(client, key))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn path(&self) -> String {
        format!("/v4/spreadsheets/{}", self.key)
    }

    fn values_path(&self, range: &str) -> String {
        format!(
            "{}/values/{}",
            self.path(),
            utf8_percent_encode(range, NON_ALPHANUMERIC)
        )
    }

    /// Run a `batchUpdate` with the given requests.
    pub async fn update(&self, requests: Vec<Value>) -> GcpResult<Value> {
        debug!("Executing updates");
        self.client
            .post(
                SERVICE,
                &format!("{}:batchUpdate", self.path()),
                &[],
                &json!({ "requests": requests }),
            )
            .await
    }

    /// ID of the sheet titled `name`.
    pub async fn sheet_id(&self, name: &str) -> GcpResult<Option<i64>> {
        let info: SpreadsheetInfo = self
            .client
            .get(SERVICE, &self.path(), &[("fields", "sheets.properties")])
            .await?;
        Ok(info
            .sheets
            .into_iter()
            .find(|s| s.properties.title == name)
            .map(|s| s.properties.sheet_id))
    }

    pub async fn add_sheet(&self, name: &str, grid_properties: Option<GridProperties>) -> GcpResult<i64> {
        info!("Adding sheet \"{}\"", name);
        let mut properties = json!({ "title": name });
        if let Some(grid) = grid_properties {
            properties["gridProperties"] = json!(grid);
        }
        let response = self
            .update(vec![json!({ "addSheet": { "properties": properties } })])
            .await?;
        response["replies"][0]["addSheet"]["properties"]["sheetId"]
            .as_i64()
            .ok_or_else(|| GcpError::parse(SERVICE, "addSheet reply without sheetId"))
    }

    pub async fn delete_sheet(&self, name: &str, ignore_missing: bool) -> GcpResult<()> {
        info!("Deleting sheet \"{}\"", name);
        match self.sheet_id(name).await? {
            Some(sheet_id) => {
                self.update(vec![json!({ "deleteSheet": { "sheetId": sheet_id } })])
                    .await?;
                Ok(())
            }
            None if ignore_missing => Ok(()),
            None => Err(GcpError::local(
                SERVICE,
                "NOT_FOUND",
                format!("Sheet \"{}\" not found", name),
            )),
        }
    }

    /// Whole sheet as a table; the first row is the header.
    pub async fn get_sheet(&self, name: &str) -> GcpResult<Table> {
        info!("Loading sheet \"{}\"", name);
        let range: ValueRange = self
            .client
            .get(
                SERVICE,
                &self.values_path(name),
                &[("valueRenderOption", "UNFORMATTED_VALUE")],
            )
            .await?;

        let mut rows = range.values.into_iter();
        let header: Vec<String> = rows
            .next()
            .map(|h| h.iter().map(header_name).collect())
            .unwrap_or_default();
        let mut table = Table::new(header);
        for row in rows {
            let mut cells: Vec<Cell> = row.iter().map(cell_from_value).collect();
            if cells.len() < table.width() {
                cells.resize(table.width(), Cell::Null);
            }
            table.push_row(cells)?;
        }
        Ok(table)
    }

    /// Replace the sheet contents with `table`, creating the sheet if needed.
    pub async fn set_sheet(&self, name: &str, table: &Table) -> GcpResult<()> {
        let grid = GridProperties {
            row_count: table.height() + 1,
            column_count: table.width(),
            frozen_row_count: (table.height() > 0).then_some(1),
        };

        let mut updates: Vec<Value> = Vec::new();
        let sheet_id = match self.sheet_id(name).await? {
            Some(sheet_id) => {
                updates.push(json!({
                    "updateSheetProperties": {
                        "fields": "gridProperties",
                        "properties": {"gridProperties": grid, "sheetId": sheet_id},
                    }
                }));
                updates.push(json!({
                    "updateCells": {"fields": "userEnteredFormat", "range": {"sheetId": sheet_id}}
                }));
                sheet_id
            }
            None => self.add_sheet(name, Some(grid)).await?,
        };

        updates.push(format_request(
            json!({"textFormat": {"bold": true}, "wrapStrategy": "WRAP"}),
            GridRange::rows(sheet_id, 0, 1),
        ));
        for (index, column_type) in table.column_types().into_iter().enumerate() {
            let range = GridRange::columns(sheet_id, index, index + 1);
            let alignment = if column_type.is_numeric() { "RIGHT" } else { "LEFT" };
            updates.push(format_request(json!({"horizontalAlignment": alignment}), range.clone()));
            let pattern = match column_type {
                ColumnType::Integer => Some("#,##0"),
                ColumnType::Float => Some("#,##0.00"),
                _ => None,
            };
            if let Some(pattern) = pattern {
                updates.push(format_request(
                    json!({"numberFormat": {"pattern": pattern, "type": "NUMBER"}}),
                    range,
                ));
            }
        }

        info!("Updating sheet \"{}\"", name);
        self.update(updates).await?;
        self.update_values(name, table).await?;

        self.update(vec![json!({
            "autoResizeDimensions": {
                "dimensions": {"dimension": "COLUMNS", "sheetId": sheet_id}
            }
        })])
        .await?;
        Ok(())
    }

    /// Write the header and rows of `table` starting at the top left cell.
    pub async fn update_values(&self, name: &str, table: &Table) -> GcpResult<()> {
        debug!("Updating values");
        let _: Value = self
            .client
            .put(
                SERVICE,
                &self.values_path(name),
                &[("valueInputOption", "RAW")],
                &json!({ "values": table_values(table) }),
            )
            .await?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
