// Row-to-column conversion shared by every backend connection.
//
// Drivers hand over rows of loosely typed cells plus whatever type information the
// wire protocol declared; the builder settles one Arrow type per column and slices
// the rows into record batches of the configured size.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use datafusion::arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder,
    NullArray, StringBuilder, TimestampMicrosecondBuilder,
};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchOptions};

use crate::error::{PoolError, Result};

/// Logical column type as far as the engine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalType {
    Boolean,
    Int64,
    Float64,
    Text,
    Binary,
    Date,
    Timestamp,
    /// No type information and no non-null value seen.
    Null,
}

impl LogicalType {
    pub fn data_type(&self) -> DataType {
        match self {
            LogicalType::Boolean => DataType::Boolean,
            LogicalType::Int64 => DataType::Int64,
            LogicalType::Float64 => DataType::Float64,
            LogicalType::Text => DataType::Utf8,
            LogicalType::Binary => DataType::Binary,
            LogicalType::Date => DataType::Date32,
            LogicalType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
            LogicalType::Null => DataType::Null,
        }
    }

    /// Inverse of [`LogicalType::data_type`]; `None` for types no backend produces.
    pub fn from_data_type(data_type: &DataType) -> Option<LogicalType> {
        match data_type {
            DataType::Boolean => Some(LogicalType::Boolean),
            DataType::Int64 => Some(LogicalType::Int64),
            DataType::Float64 => Some(LogicalType::Float64),
            DataType::Utf8 => Some(LogicalType::Text),
            DataType::Binary => Some(LogicalType::Binary),
            DataType::Date32 => Some(LogicalType::Date),
            DataType::Timestamp(TimeUnit::Microsecond, None) => Some(LogicalType::Timestamp),
            DataType::Null => Some(LogicalType::Null),
            _ => None,
        }
    }

    /// Narrowest type able to hold values of both `self` and `other`.
    pub fn unify(self, other: LogicalType) -> LogicalType {
        use LogicalType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Null, t) | (t, Null) => t,
            (Int64, Float64) | (Float64, Int64) => Float64,
            (Boolean, Int64) | (Int64, Boolean) => Int64,
            (Date, Timestamp) | (Timestamp, Date) => Timestamp,
            _ => Text,
        }
    }
}

/// A single value as produced by a driver.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl CellValue {
    fn logical_type(&self) -> LogicalType {
        match self {
            CellValue::Null => LogicalType::Null,
            CellValue::Bool(_) => LogicalType::Boolean,
            CellValue::Int(_) => LogicalType::Int64,
            CellValue::Float(_) => LogicalType::Float64,
            CellValue::Text(_) => LogicalType::Text,
            CellValue::Bytes(_) => LogicalType::Binary,
            CellValue::Date(_) => LogicalType::Date,
            CellValue::Timestamp(_) => LogicalType::Timestamp,
        }
    }

    fn to_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Bool(v) => Some(v.to_string()),
            CellValue::Int(v) => Some(v.to_string()),
            CellValue::Float(v) => Some(v.to_string()),
            CellValue::Text(v) => Some(v.clone()),
            CellValue::Bytes(v) => Some(String::from_utf8_lossy(v).into_owned()),
            CellValue::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            CellValue::Timestamp(v) => Some(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        }
    }
}

/// Schema plus the record batches one sub-query produced.
#[derive(Debug, Clone)]
pub struct ColumnBatches {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl ColumnBatches {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }
}

/// Accumulates rows from a driver and turns them into [`ColumnBatches`].
pub struct BatchBuilder {
    names: Vec<String>,
    declared: Vec<Option<LogicalType>>,
    rows: Vec<Vec<CellValue>>,
    batch_size: usize,
}

impl BatchBuilder {
    /// `declared[i]` is the type the protocol announced for column `i`, if any.
    pub fn new(names: Vec<String>, declared: Vec<Option<LogicalType>>, batch_size: usize) -> Self {
        debug_assert_eq!(names.len(), declared.len());
        Self {
            names,
            declared,
            rows: Vec::new(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn push_row(&mut self, row: Vec<CellValue>) -> Result<()> {
        if row.len() != self.names.len() {
            return Err(PoolError::execution(format!(
                "row has {} values but the result declares {} columns",
                row.len(),
                self.names.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn finish(self) -> Result<ColumnBatches> {
        let types = self.resolve_types();
        let fields: Vec<Field> = self
            .names
            .iter()
            .zip(types.iter())
            .map(|(name, ty)| Field::new(name, ty.data_type(), true))
            .collect();
        let schema = Arc::new(Schema::new(fields));

        let mut batches = Vec::new();
        for chunk in self.rows.chunks(self.batch_size) {
            let columns = types
                .iter()
                .enumerate()
                .map(|(idx, ty)| build_column(&self.names[idx], *ty, chunk, idx))
                .collect::<Result<Vec<_>>>()?;
            let options = RecordBatchOptions::new().with_row_count(Some(chunk.len()));
            batches.push(RecordBatch::try_new_with_options(
                schema.clone(),
                columns,
                &options,
            )?);
        }

        Ok(ColumnBatches { schema, batches })
    }

    fn resolve_types(&self) -> Vec<LogicalType> {
        (0..self.names.len())
            .map(|idx| match self.declared[idx] {
                Some(ty) if ty != LogicalType::Null => ty,
                _ => self
                    .rows
                    .iter()
                    .map(|row| row[idx].logical_type())
                    .fold(LogicalType::Null, LogicalType::unify),
            })
            .collect()
    }
}

fn conversion_error(column: &str, value: &CellValue, ty: LogicalType) -> PoolError {
    PoolError::execution(format!(
        "column {}: cannot convert {:?} to {:?}",
        column, value, ty
    ))
}

fn unix_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn build_column(
    name: &str,
    ty: LogicalType,
    rows: &[Vec<CellValue>],
    idx: usize,
) -> Result<ArrayRef> {
    let values = rows.iter().map(|row| &row[idx]);
    let array: ArrayRef = match ty {
        LogicalType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(rows.len());
            for value in values {
                match value {
                    CellValue::Null => builder.append_null(),
                    CellValue::Bool(v) => builder.append_value(*v),
                    CellValue::Int(v) => builder.append_value(*v != 0),
                    CellValue::Text(v) => match v.to_lowercase().as_str() {
                        "t" | "true" | "1" => builder.append_value(true),
                        "f" | "false" | "0" => builder.append_value(false),
                        _ => return Err(conversion_error(name, value, ty)),
                    },
                    other => return Err(conversion_error(name, other, ty)),
                }
            }
            Arc::new(builder.finish())
        }
        LogicalType::Int64 => {
            let mut builder = Int64Builder::with_capacity(rows.len());
            for value in values {
                match value {
                    CellValue::Null => builder.append_null(),
                    CellValue::Int(v) => builder.append_value(*v),
                    CellValue::Bool(v) => builder.append_value(i64::from(*v)),
                    CellValue::Float(v) if v.fract() == 0.0 => builder.append_value(*v as i64),
                    CellValue::Text(v) => builder.append_value(
                        v.trim()
                            .parse::<i64>()
                            .map_err(|_| conversion_error(name, value, ty))?,
                    ),
                    other => return Err(conversion_error(name, other, ty)),
                }
            }
            Arc::new(builder.finish())
        }
        LogicalType::Float64 => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for value in values {
                match value {
                    CellValue::Null => builder.append_null(),
                    CellValue::Float(v) => builder.append_value(*v),
                    CellValue::Int(v) => builder.append_value(*v as f64),
                    CellValue::Text(v) => builder.append_value(
                        v.trim()
                            .parse::<f64>()
                            .map_err(|_| conversion_error(name, value, ty))?,
                    ),
                    other => return Err(conversion_error(name, other, ty)),
                }
            }
            Arc::new(builder.finish())
        }
        LogicalType::Text => {
            let mut builder = StringBuilder::with_capacity(rows.len(), rows.len() * 16);
            for value in values {
                builder.append_option(value.to_text());
            }
            Arc::new(builder.finish())
        }
        LogicalType::Binary => {
            let mut builder = BinaryBuilder::with_capacity(rows.len(), rows.len() * 16);
            for value in values {
                match value {
                    CellValue::Null => builder.append_null(),
                    CellValue::Bytes(v) => builder.append_value(v),
                    CellValue::Text(v) => builder.append_value(v.as_bytes()),
                    other => return Err(conversion_error(name, other, ty)),
                }
            }
            Arc::new(builder.finish())
        }
        LogicalType::Date => {
            let mut builder = Date32Builder::with_capacity(rows.len());
            let epoch = unix_epoch();
            for value in values {
                let date = match value {
                    CellValue::Null => None,
                    CellValue::Date(d) => Some(*d),
                    CellValue::Timestamp(ts) => Some(ts.date()),
                    CellValue::Text(v) => Some(
                        NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d")
                            .map_err(|_| conversion_error(name, value, ty))?,
                    ),
                    other => return Err(conversion_error(name, other, ty)),
                };
                builder.append_option(date.map(|d| (d - epoch).num_days() as i32));
            }
            Arc::new(builder.finish())
        }
        LogicalType::Timestamp => {
            let mut builder = TimestampMicrosecondBuilder::with_capacity(rows.len());
            for value in values {
                let ts = match value {
                    CellValue::Null => None,
                    CellValue::Timestamp(ts) => Some(*ts),
                    CellValue::Date(d) => d.and_hms_opt(0, 0, 0),
                    CellValue::Text(v) => Some(
                        parse_timestamp(v.trim()).ok_or_else(|| conversion_error(name, value, ty))?,
                    ),
                    other => return Err(conversion_error(name, other, ty)),
                };
                builder.append_option(ts.map(|ts| ts.and_utc().timestamp_micros()));
            }
            Arc::new(builder.finish())
        }
        LogicalType::Null => {
            if let Some(value) = rows.iter().map(|row| &row[idx]).find(|v| **v != CellValue::Null) {
                return Err(conversion_error(name, value, ty));
            }
            Arc::new(NullArray::new(rows.len()))
        }
    };
    Ok(array)
}
