// Apache Druid over the SQL HTTP API
// Every request is independent, so a "connection" is just a configured HTTP client.
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use super::adapter::SourceConnection;
use super::batch::{BatchBuilder, CellValue, ColumnBatches, LogicalType};
use super::{Backend, Protocol};
use crate::error::{PoolError, Result};

pub struct DruidConnection {
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DruidSqlRequest {
    query: String,
    result_format: &'static str,
    header: bool,
    sql_types_header: bool,
    context: Value,
}

impl DruidConnection {
    pub fn new(connection_url: &str) -> Result<Self> {
        let base_url = base_url(connection_url)?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| PoolError::Connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute SQL query via Druid SQL API
    async fn execute_sql(&self, sql: &str) -> Result<Vec<Vec<Value>>> {
        let sql_endpoint = format!("{}/druid/v2/sql", self.base_url);

        let request = DruidSqlRequest {
            query: sql.to_string(),
            result_format: "array",
            header: true,
            sql_types_header: true,
            context: serde_json::json!({ "sqlTimeZone": "UTC" }),
        };

        let response = self
            .client
            .post(&sql_endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| PoolError::Connection(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PoolError::execution(format!(
                "Druid SQL query failed ({}): {}",
                status, error_body
            )));
        }

        response
            .json::<Vec<Vec<Value>>>()
            .await
            .map_err(|e| PoolError::execution(format!("Failed to parse Druid response: {}", e)))
    }
}

#[async_trait::async_trait]
impl SourceConnection for DruidConnection {
    async fn execute(
        &mut self,
        sql: &str,
        protocol: Protocol,
        batch_size: usize,
    ) -> Result<ColumnBatches> {
        if protocol != Protocol::Text {
            return Err(PoolError::InvalidArgument(format!(
                "Druid does not support the {} protocol",
                protocol
            )));
        }
        let rows = self.execute_sql(sql).await?;
        rows_to_batches(rows, batch_size)
    }

    async fn batch_execute(&mut self, _sql: &str) -> Result<()> {
        Err(PoolError::InvalidArgument(
            "Druid does not support session statements".to_string(),
        ))
    }

    async fn ping(&mut self) -> bool {
        let endpoint = format!("{}/status/health", self.base_url);
        match self.client.get(&endpoint).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Druid health check failed: {}", e);
                false
            }
        }
    }

    fn is_broken(&self) -> bool {
        false
    }

    fn backend(&self) -> Backend {
        Backend::Druid
    }
}

/// druid://host:port becomes http://host:port; http(s) URLs lose their path.
fn base_url(connection_url: &str) -> Result<String> {
    let url = Url::parse(connection_url)
        .map_err(|e| PoolError::Configuration(format!("Invalid Druid URL: {}", e)))?;
    let host = url.host_str().unwrap_or("localhost");

    match url.scheme() {
        "druid" => Ok(format!("http://{}:{}", host, url.port().unwrap_or(8888))),
        "http" | "https" => Ok(format!(
            "{}://{}{}",
            url.scheme(),
            host,
            url.port().map(|p| format!(":{}", p)).unwrap_or_default()
        )),
        other => Err(PoolError::Configuration(format!(
            "URL must use druid://, http://, or https:// scheme for Druid, got {}",
            other
        ))),
    }
}

/// Array result format: column names, then SQL type names, then data rows.
fn rows_to_batches(rows: Vec<Vec<Value>>, batch_size: usize) -> Result<ColumnBatches> {
    let mut rows = rows.into_iter();
    let names: Vec<String> = match rows.next() {
        Some(header) => header
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        None => return BatchBuilder::new(Vec::new(), Vec::new(), batch_size).finish(),
    };
    let declared: Vec<Option<LogicalType>> = match rows.next() {
        Some(types) => types
            .iter()
            .map(|v| v.as_str().and_then(declared_type))
            .collect(),
        None => vec![None; names.len()],
    };
    let timestamps: Vec<bool> = declared
        .iter()
        .map(|t| *t == Some(LogicalType::Timestamp))
        .collect();

    let mut builder = BatchBuilder::new(names, declared, batch_size);
    for row in rows {
        let cells = row
            .into_iter()
            .zip(timestamps.iter())
            .map(|(value, is_timestamp)| to_cell(value, *is_timestamp))
            .collect();
        builder.push_row(cells)?;
    }
    builder.finish()
}

fn declared_type(sql_type: &str) -> Option<LogicalType> {
    match sql_type.to_uppercase().as_str() {
        "BIGINT" | "INTEGER" | "SMALLINT" | "TINYINT" => Some(LogicalType::Int64),
        "DOUBLE" | "FLOAT" | "REAL" | "DECIMAL" => Some(LogicalType::Float64),
        "VARCHAR" | "CHAR" => Some(LogicalType::Text),
        "BOOLEAN" => Some(LogicalType::Boolean),
        "TIMESTAMP" => Some(LogicalType::Timestamp),
        "DATE" => Some(LogicalType::Date),
        _ => None,
    }
}

fn to_cell(value: Value, is_timestamp: bool) -> CellValue {
    match value {
        Value::Null => CellValue::Null,
        Value::Bool(b) => CellValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => CellValue::Int(i),
            None => CellValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        // ISO-8601 with a trailing Z
        Value::String(s) if is_timestamp => CellValue::Text(s.trim_end_matches('Z').to_string()),
        Value::String(s) => CellValue::Text(s),
        other => CellValue::Text(other.to_string()),
    }
}
