// PostgreSQL connection over tokio-postgres with binary, text and cursor transfer
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::TryStreamExt;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, NoTls, Row, SimpleQueryMessage};

use super::adapter::SourceConnection;
use super::batch::{BatchBuilder, CellValue, ColumnBatches, LogicalType};
use super::{Backend, Protocol};
use crate::error::{PoolError, Result};

pub struct PostgresConnection {
    client: Client,
    broken: bool,
}

impl PostgresConnection {
    pub async fn connect(conn: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(conn, NoTls)
            .await
            .map_err(|e| PoolError::Connection(format!("Failed to connect to PostgreSQL: {}", error_details(&e))))?;

        // The connection object performs the actual socket IO
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Self {
            client,
            broken: false,
        })
    }

    fn fail(&mut self, e: tokio_postgres::Error) -> PoolError {
        if e.is_closed() {
            self.broken = true;
        }
        PoolError::execution(format!("Query execution failed: {}", error_details(&e)))
    }

    async fn execute_binary(&mut self, sql: &str, batch_size: usize) -> Result<ColumnBatches> {
        let statement = match self.client.prepare(sql).await {
            Ok(statement) => statement,
            Err(e) => return Err(self.fail(e)),
        };
        let types: Vec<Type> = statement.columns().iter().map(|c| c.type_().clone()).collect();
        let mut builder = BatchBuilder::new(
            statement.columns().iter().map(|c| c.name().to_string()).collect(),
            types.iter().map(declared_type).collect(),
            batch_size,
        );

        let stream = match self.client.query_raw(&statement, Vec::<String>::new()).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(e)),
        };
        futures::pin_mut!(stream);
        loop {
            match stream.try_next().await {
                Ok(Some(row)) => builder.push_row(read_row(&row, &types)?)?,
                Ok(None) => break,
                Err(e) => return Err(self.fail(e)),
            }
        }

        builder.finish()
    }

    async fn execute_text(&mut self, sql: &str, batch_size: usize) -> Result<ColumnBatches> {
        let messages = match self.client.simple_query(sql).await {
            Ok(messages) => messages,
            Err(e) => return Err(self.fail(e)),
        };

        let text_builder = |names: Vec<String>| {
            let declared = vec![Some(LogicalType::Text); names.len()];
            BatchBuilder::new(names, declared, batch_size)
        };

        // Only the first result set is returned
        let mut builder: Option<BatchBuilder> = None;
        for message in messages {
            match message {
                SimpleQueryMessage::RowDescription(columns) => {
                    if builder.is_none() {
                        builder = Some(text_builder(
                            columns.iter().map(|c| c.name().to_string()).collect(),
                        ));
                    }
                }
                SimpleQueryMessage::Row(row) => {
                    let builder = builder.get_or_insert_with(|| {
                        text_builder(row.columns().iter().map(|c| c.name().to_string()).collect())
                    });
                    let cells = (0..row.len())
                        .map(|idx| match row.get(idx) {
                            Some(text) => CellValue::Text(text.to_string()),
                            None => CellValue::Null,
                        })
                        .collect();
                    builder.push_row(cells)?;
                }
                SimpleQueryMessage::CommandComplete(_) if builder.is_some() => break,
                _ => {}
            }
        }

        builder
            .unwrap_or_else(|| BatchBuilder::new(Vec::new(), Vec::new(), batch_size))
            .finish()
    }

    async fn execute_cursor(&mut self, sql: &str, batch_size: usize) -> Result<ColumnBatches> {
        match self.fetch_with_cursor(sql, batch_size).await {
            Ok(result) => Ok(result),
            Err(CursorError::Postgres(e)) => Err(self.fail(e)),
            Err(CursorError::Pool(e)) => Err(e),
        }
    }

    async fn fetch_with_cursor(
        &mut self,
        sql: &str,
        batch_size: usize,
    ) -> std::result::Result<ColumnBatches, CursorError> {
        let batch_size = batch_size.max(1);
        let transaction = self.client.transaction().await?;
        transaction
            .batch_execute(&format!("DECLARE cx_cursor NO SCROLL CURSOR FOR {}", sql))
            .await?;

        let fetch = transaction
            .prepare(&format!("FETCH {} FROM cx_cursor", batch_size))
            .await?;
        let types: Vec<Type> = fetch.columns().iter().map(|c| c.type_().clone()).collect();
        let mut builder = BatchBuilder::new(
            fetch.columns().iter().map(|c| c.name().to_string()).collect(),
            types.iter().map(declared_type).collect(),
            batch_size,
        );

        loop {
            let rows = transaction.query(&fetch, &[]).await?;
            if rows.is_empty() {
                break;
            }
            for row in &rows {
                builder.push_row(read_row(row, &types)?)?;
            }
        }

        transaction.batch_execute("CLOSE cx_cursor").await?;
        transaction.commit().await?;
        Ok(builder.finish()?)
    }
}

enum CursorError {
    Postgres(tokio_postgres::Error),
    Pool(PoolError),
}

impl From<tokio_postgres::Error> for CursorError {
    fn from(e: tokio_postgres::Error) -> Self {
        CursorError::Postgres(e)
    }
}

impl From<PoolError> for CursorError {
    fn from(e: PoolError) -> Self {
        CursorError::Pool(e)
    }
}

#[async_trait::async_trait]
impl SourceConnection for PostgresConnection {
    async fn execute(
        &mut self,
        sql: &str,
        protocol: Protocol,
        batch_size: usize,
    ) -> Result<ColumnBatches> {
        match protocol {
            Protocol::Binary => self.execute_binary(sql, batch_size).await,
            Protocol::Text => self.execute_text(sql, batch_size).await,
            Protocol::Cursor => self.execute_cursor(sql, batch_size).await,
        }
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<()> {
        match self.client.batch_execute(sql).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn ping(&mut self) -> bool {
        match self.client.simple_query("SELECT 1").await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("PostgreSQL ping failed: {}", e);
                self.broken = true;
                false
            }
        }
    }

    fn is_broken(&self) -> bool {
        self.broken || self.client.is_closed()
    }

    fn backend(&self) -> Backend {
        Backend::Postgres
    }
}

fn error_details(e: &tokio_postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!(
            "Code: {}, Message: {}",
            db_error.code().code(),
            db_error.message()
        )
    } else {
        format!("{}", e)
    }
}

/// Arrow-facing type for a PostgreSQL column type, if it has a fixed one.
fn declared_type(pg_type: &Type) -> Option<LogicalType> {
    match *pg_type {
        Type::BOOL => Some(LogicalType::Boolean),
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => Some(LogicalType::Int64),
        Type::FLOAT4 | Type::FLOAT8 | Type::NUMERIC => Some(LogicalType::Float64),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => Some(LogicalType::Text),
        Type::BYTEA => Some(LogicalType::Binary),
        Type::DATE => Some(LogicalType::Date),
        Type::TIMESTAMP | Type::TIMESTAMPTZ => Some(LogicalType::Timestamp),
        Type::UUID | Type::JSON | Type::JSONB => Some(LogicalType::Text),
        _ => None,
    }
}

fn read_row(row: &Row, types: &[Type]) -> Result<Vec<CellValue>> {
    types
        .iter()
        .enumerate()
        .map(|(idx, ty)| {
            read_cell(row, idx, ty).map_err(|e| {
                PoolError::execution(format!(
                    "Failed to decode column {} ({}): {}",
                    row.columns()[idx].name(),
                    ty.name(),
                    e
                ))
            })
        })
        .collect()
}

fn read_cell(
    row: &Row,
    idx: usize,
    ty: &Type,
) -> std::result::Result<CellValue, tokio_postgres::Error> {
    let cell = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(CellValue::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| CellValue::Int(v.into())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| CellValue::Int(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(CellValue::Int),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|v| CellValue::Int(v.into())),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| CellValue::Float(v.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(CellValue::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<Numeric>>(idx)?
            .map(|v| CellValue::Float(v.0)),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(idx)?.map(CellValue::Text)
        }
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(CellValue::Bytes),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(CellValue::Date),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(CellValue::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| CellValue::Timestamp(v.naive_utc())),
        _ => row
            .try_get::<_, Option<RawCell>>(idx)?
            .map(|raw| raw_to_cell(ty, raw.0)),
    };
    Ok(cell.unwrap_or(CellValue::Null))
}

fn raw_to_cell(ty: &Type, raw: Vec<u8>) -> CellValue {
    if *ty == Type::UUID {
        if let Ok(id) = uuid::Uuid::from_slice(&raw) {
            return CellValue::Text(id.hyphenated().to_string());
        }
    }
    // jsonb binary format is a version byte followed by the JSON text
    let raw = if *ty == Type::JSONB && raw.first() == Some(&1) {
        raw[1..].to_vec()
    } else {
        raw
    };
    match String::from_utf8(raw) {
        Ok(text) => CellValue::Text(text),
        Err(e) => CellValue::Bytes(e.into_bytes()),
    }
}

/// Undecoded wire value for types without a native Rust mapping.
struct RawCell(Vec<u8>);

impl<'a> FromSql<'a> for RawCell {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(RawCell(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// NUMERIC decoded from its base-10000 binary representation.
struct Numeric(f64);

impl<'a> FromSql<'a> for Numeric {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        decode_numeric(raw).map(Numeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn decode_numeric(
    raw: &[u8],
) -> std::result::Result<f64, Box<dyn std::error::Error + Sync + Send>> {
    const NUMERIC_NEG: u16 = 0x4000;
    const NUMERIC_NAN: u16 = 0xC000;

    if raw.len() < 8 {
        return Err("invalid numeric header".into());
    }
    let ndigits = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    let weight = i16::from_be_bytes([raw[2], raw[3]]) as i32;
    let sign = u16::from_be_bytes([raw[4], raw[5]]);
    if sign == NUMERIC_NAN {
        return Ok(f64::NAN);
    }
    if raw.len() < 8 + ndigits * 2 {
        return Err("truncated numeric value".into());
    }

    let mut value = 0f64;
    for i in 0..ndigits {
        let offset = 8 + i * 2;
        let digit = i16::from_be_bytes([raw[offset], raw[offset + 1]]) as f64;
        value += digit * 10000f64.powi(weight - i as i32);
    }
    if sign == NUMERIC_NEG {
        value = -value;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_bytes(ndigits: u16, weight: i16, sign: u16, digits: &[i16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ndigits.to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&0u16.to_be_bytes());
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_decode_numeric() {
        // 12345.67 = [1, 2345, 6700] with weight 1
        let raw = numeric_bytes(3, 1, 0, &[1, 2345, 6700]);
        let value = decode_numeric(&raw).unwrap();
        assert!((value - 12345.67).abs() < 1e-9);

        let raw = numeric_bytes(1, 0, 0x4000, &[42]);
        assert_eq!(decode_numeric(&raw).unwrap(), -42.0);

        let raw = numeric_bytes(0, 0, 0, &[]);
        assert_eq!(decode_numeric(&raw).unwrap(), 0.0);
    }

    #[test]
    fn test_decode_numeric_rejects_truncated() {
        let mut raw = numeric_bytes(2, 0, 0, &[1, 2]);
        raw.truncate(9);
        assert!(decode_numeric(&raw).is_err());
    }

    #[test]
    fn test_declared_types() {
        assert_eq!(declared_type(&Type::INT4), Some(LogicalType::Int64));
        assert_eq!(declared_type(&Type::NUMERIC), Some(LogicalType::Float64));
        assert_eq!(declared_type(&Type::TIMESTAMPTZ), Some(LogicalType::Timestamp));
        assert_eq!(declared_type(&Type::INET), None);
    }

    #[test]
    fn test_raw_cells() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(
            raw_to_cell(&Type::UUID, id.as_bytes().to_vec()),
            CellValue::Text(id.hyphenated().to_string())
        );
        assert_eq!(
            raw_to_cell(&Type::JSONB, b"\x01{\"a\":1}".to_vec()),
            CellValue::Text("{\"a\":1}".to_string())
        );
    }
}
