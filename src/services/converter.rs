// Result adapter
//
// Shapes a merged Arrow table into the representation a caller asked for:
// record batches, JSON rows, or a DataFusion DataFrame.

use chrono::{DateTime, NaiveDate};
use datafusion::arrow::array::*;
use datafusion::arrow::datatypes::{DataType, TimeUnit};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::prelude::SessionContext;
use serde_json::{json, Value as JsonValue};

use crate::error::{PoolError, Result};
use crate::models::{MergedTable, QueryResult, ReturnType, Table};

pub struct ResultConverter;

impl ResultConverter {
    /// Adapt a merged table to `return_type`.
    pub fn adapt(table: MergedTable, return_type: ReturnType) -> Result<Table> {
        match return_type {
            ReturnType::Arrow => Ok(Table::Arrow(table)),
            ReturnType::Rows => Ok(Table::Rows(Self::to_query_result(&table)?)),
            ReturnType::DataFrame => Ok(Table::DataFrame(Self::to_dataframe(table)?)),
        }
    }

    /// Row-major JSON view of a merged table.
    pub fn to_query_result(table: &MergedTable) -> Result<QueryResult> {
        let columns = table.column_names();
        let mut rows = Vec::with_capacity(table.num_rows());
        for batch in table.batches() {
            rows.extend(Self::batch_to_json_rows(batch)?);
        }

        Ok(QueryResult {
            row_count: rows.len(),
            columns,
            rows,
            partitions: table.partitions(),
        })
    }

    /// Register the batches as an in-memory DataFrame.
    pub fn to_dataframe(table: MergedTable) -> Result<datafusion::dataframe::DataFrame> {
        let ctx = SessionContext::new();
        let schema = table.schema();
        let mut batches = table.into_batches();
        if batches.is_empty() {
            batches.push(RecordBatch::new_empty(schema));
        }
        ctx.read_batches(batches)
            .map_err(|e| PoolError::execution(format!("Failed to build DataFrame: {}", e)))
    }

    fn batch_to_json_rows(batch: &RecordBatch) -> Result<Vec<Vec<JsonValue>>> {
        let mut rows = Vec::with_capacity(batch.num_rows());
        for row_idx in 0..batch.num_rows() {
            let row = batch
                .columns()
                .iter()
                .map(|column| Self::array_value_to_json(column, row_idx))
                .collect::<Result<Vec<_>>>()?;
            rows.push(row);
        }
        Ok(rows)
    }

    fn array_value_to_json(array: &ArrayRef, row_idx: usize) -> Result<JsonValue> {
        if array.is_null(row_idx) {
            return Ok(JsonValue::Null);
        }

        let value = match array.data_type() {
            DataType::Null => JsonValue::Null,
            DataType::Boolean => json!(downcast::<BooleanArray>(array)?.value(row_idx)),
            DataType::Int16 => json!(downcast::<Int16Array>(array)?.value(row_idx)),
            DataType::Int32 => json!(downcast::<Int32Array>(array)?.value(row_idx)),
            DataType::Int64 => json!(downcast::<Int64Array>(array)?.value(row_idx)),
            DataType::UInt64 => json!(downcast::<UInt64Array>(array)?.value(row_idx)),
            DataType::Float32 => json!(downcast::<Float32Array>(array)?.value(row_idx)),
            DataType::Float64 => json!(downcast::<Float64Array>(array)?.value(row_idx)),
            DataType::Utf8 => json!(downcast::<StringArray>(array)?.value(row_idx)),
            DataType::LargeUtf8 => json!(downcast::<LargeStringArray>(array)?.value(row_idx)),
            DataType::Binary => json!(hex(downcast::<BinaryArray>(array)?.value(row_idx))),
            DataType::LargeBinary => {
                json!(hex(downcast::<LargeBinaryArray>(array)?.value(row_idx)))
            }
            DataType::Date32 => {
                let days = downcast::<Date32Array>(array)?.value(row_idx);
                // Date32 counts days from 1970-01-01
                let date = NaiveDate::from_num_days_from_ce_opt(days + 719_163)
                    .ok_or_else(|| PoolError::execution(format!("Invalid date value {}", days)))?;
                json!(date.format("%Y-%m-%d").to_string())
            }
            DataType::Timestamp(unit, _) => {
                let timestamp = match unit {
                    TimeUnit::Second => {
                        DateTime::from_timestamp(downcast::<TimestampSecondArray>(array)?.value(row_idx), 0)
                    }
                    TimeUnit::Millisecond => DateTime::from_timestamp_millis(
                        downcast::<TimestampMillisecondArray>(array)?.value(row_idx),
                    ),
                    TimeUnit::Microsecond => DateTime::from_timestamp_micros(
                        downcast::<TimestampMicrosecondArray>(array)?.value(row_idx),
                    ),
                    TimeUnit::Nanosecond => Some(DateTime::from_timestamp_nanos(
                        downcast::<TimestampNanosecondArray>(array)?.value(row_idx),
                    )),
                };
                let dt = timestamp
                    .ok_or_else(|| PoolError::execution("Invalid timestamp value".to_string()))?;
                json!(dt.to_rfc3339())
            }
            other => {
                tracing::warn!("Unsupported Arrow data type: {:?}", other);
                json!(format!("UNSUPPORTED_TYPE_{:?}", other))
            }
        };

        Ok(value)
    }
}

fn downcast<T: 'static>(array: &ArrayRef) -> Result<&T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        PoolError::execution(format!(
            "Failed to downcast {} array",
            array.data_type()
        ))
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
