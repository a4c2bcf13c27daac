// MySQL / MariaDB connection over mysql_async
use chrono::NaiveDate;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Column, Conn, Opts, QueryResult, Value as MySqlValue};

use super::adapter::SourceConnection;
use super::batch::{BatchBuilder, CellValue, ColumnBatches, LogicalType};
use super::{Backend, Protocol};
use crate::error::{PoolError, Result};

/// Character set number MySQL reports for binary strings.
const BINARY_CHARSET: u16 = 63;

pub struct MySqlConnection {
    conn: Conn,
    broken: bool,
}

impl MySqlConnection {
    pub async fn connect(connection_url: &str) -> Result<Self> {
        let opts = Opts::from_url(&normalize_scheme(connection_url))
            .map_err(|e| PoolError::Configuration(format!("Invalid MySQL URL: {}", e)))?;
        let conn = Conn::new(opts)
            .await
            .map_err(|e| PoolError::Connection(format!("Failed to connect to MySQL: {}", e)))?;
        Ok(Self {
            conn,
            broken: false,
        })
    }

    fn fail(&mut self, e: mysql_async::Error) -> PoolError {
        if matches!(e, mysql_async::Error::Io(_) | mysql_async::Error::Driver(_)) {
            self.broken = true;
        }
        PoolError::execution(format!("Query execution failed: {}", e))
    }
}

#[async_trait::async_trait]
impl SourceConnection for MySqlConnection {
    async fn execute(
        &mut self,
        sql: &str,
        protocol: Protocol,
        batch_size: usize,
    ) -> Result<ColumnBatches> {
        let outcome = match protocol {
            Protocol::Binary => match self.conn.exec_iter(sql, ()).await {
                Ok(result) => collect_result(result, batch_size).await,
                Err(e) => Err(e),
            },
            Protocol::Text => match self.conn.query_iter(sql).await {
                Ok(result) => collect_result(result, batch_size).await,
                Err(e) => Err(e),
            },
            Protocol::Cursor => {
                return Err(PoolError::InvalidArgument(
                    "MySQL does not support the cursor protocol".to_string(),
                ))
            }
        };
        match outcome {
            Ok(result) => result,
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<()> {
        match self.conn.query_drop(sql).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn ping(&mut self) -> bool {
        match self.conn.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("MySQL ping failed: {}", e);
                self.broken = true;
                false
            }
        }
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn backend(&self) -> Backend {
        Backend::MySql
    }
}

/// Drain the first result set. Driver errors stay separate from conversion errors
/// so the caller can tell whether the link itself failed.
async fn collect_result<P>(
    mut result: QueryResult<'_, '_, P>,
    batch_size: usize,
) -> std::result::Result<Result<ColumnBatches>, mysql_async::Error>
where
    P: mysql_async::prelude::Protocol,
{
    let columns = result.columns().map(|c| c.to_vec()).unwrap_or_default();
    let mut builder = BatchBuilder::new(
        columns.iter().map(|c| c.name_str().to_string()).collect(),
        columns.iter().map(declared_type).collect(),
        batch_size,
    );

    let mut conversion = Ok(());
    while let Some(mut row) = result.next().await? {
        if conversion.is_err() {
            continue;
        }
        let cells = columns
            .iter()
            .enumerate()
            .map(|(idx, column)| {
                let value = row.take::<MySqlValue, usize>(idx).unwrap_or(MySqlValue::NULL);
                to_cell(column, value)
            })
            .collect();
        conversion = builder.push_row(cells);
    }
    result.drop_result().await?;

    Ok(conversion.and_then(|()| builder.finish()))
}

/// mysql_async only understands the mysql:// scheme.
fn normalize_scheme(connection_url: &str) -> String {
    match connection_url.strip_prefix("mariadb://") {
        Some(rest) => format!("mysql://{}", rest),
        None => connection_url.to_string(),
    }
}

fn is_binary(column: &Column) -> bool {
    column.character_set() == BINARY_CHARSET
}

fn declared_type(column: &Column) -> Option<LogicalType> {
    match column.column_type() {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => Some(LogicalType::Int64),
        ColumnType::MYSQL_TYPE_FLOAT
        | ColumnType::MYSQL_TYPE_DOUBLE
        | ColumnType::MYSQL_TYPE_DECIMAL
        | ColumnType::MYSQL_TYPE_NEWDECIMAL => Some(LogicalType::Float64),
        ColumnType::MYSQL_TYPE_VARCHAR
        | ColumnType::MYSQL_TYPE_VAR_STRING
        | ColumnType::MYSQL_TYPE_STRING
        | ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB
        | ColumnType::MYSQL_TYPE_BLOB => {
            if is_binary(column) {
                Some(LogicalType::Binary)
            } else {
                Some(LogicalType::Text)
            }
        }
        ColumnType::MYSQL_TYPE_ENUM
        | ColumnType::MYSQL_TYPE_SET
        | ColumnType::MYSQL_TYPE_JSON
        | ColumnType::MYSQL_TYPE_TIME
        | ColumnType::MYSQL_TYPE_TIME2 => Some(LogicalType::Text),
        ColumnType::MYSQL_TYPE_BIT => Some(LogicalType::Binary),
        ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => Some(LogicalType::Date),
        ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_DATETIME2
        | ColumnType::MYSQL_TYPE_TIMESTAMP
        | ColumnType::MYSQL_TYPE_TIMESTAMP2 => Some(LogicalType::Timestamp),
        _ => None,
    }
}

fn to_cell(column: &Column, value: MySqlValue) -> CellValue {
    match value {
        MySqlValue::NULL => CellValue::Null,
        MySqlValue::Bytes(bytes) => {
            if is_binary(column) && declared_type(column) == Some(LogicalType::Binary) {
                CellValue::Bytes(bytes)
            } else {
                match String::from_utf8(bytes) {
                    Ok(s) => CellValue::Text(s),
                    Err(e) => CellValue::Bytes(e.into_bytes()),
                }
            }
        }
        MySqlValue::Int(i) => CellValue::Int(i),
        MySqlValue::UInt(u) => match i64::try_from(u) {
            Ok(i) => CellValue::Int(i),
            Err(_) => CellValue::Text(u.to_string()),
        },
        MySqlValue::Float(f) => CellValue::Float(f.into()),
        MySqlValue::Double(d) => CellValue::Float(d),
        MySqlValue::Date(y, m, d, h, min, s, micros) => {
            let date = match NaiveDate::from_ymd_opt(y.into(), m.into(), d.into()) {
                Some(date) => date,
                // zero dates such as 0000-00-00
                None => return CellValue::Null,
            };
            if declared_type(column) == Some(LogicalType::Date) {
                CellValue::Date(date)
            } else {
                date.and_hms_micro_opt(h.into(), min.into(), s.into(), micros)
                    .map(CellValue::Timestamp)
                    .unwrap_or(CellValue::Null)
            }
        }
        MySqlValue::Time(is_neg, d, h, m, s, _) => {
            let sign = if is_neg { "-" } else { "" };
            let total_hours = d * 24 + h as u32;
            CellValue::Text(format!("{}{}:{:02}:{:02}", sign, total_hours, m, s))
        }
    }
}
