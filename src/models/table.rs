use std::fmt;
use std::str::FromStr;

use datafusion::arrow::compute::concat_batches;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::dataframe::DataFrame;
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Partition-ordered concatenation of every column batch produced by one read.
#[derive(Debug, Clone)]
pub struct MergedTable {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    partitions: usize,
}

impl MergedTable {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self {
            schema,
            batches,
            partitions: 1,
        }
    }

    /// Record how many sub-queries the table was merged from.
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<RecordBatch> {
        self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    pub fn num_columns(&self) -> usize {
        self.schema.fields().len()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.schema
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect()
    }

    /// Collapse all batches into one.
    pub fn concat(&self) -> Result<RecordBatch> {
        concat_batches(&self.schema, &self.batches).map_err(PoolError::from)
    }
}

/// Row-major result: one JSON value per cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    /// Number of sub-queries actually run, after clamping to the value domain.
    pub partitions: usize,
}

/// Output representation requested by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnType {
    /// Arrow record batches
    #[default]
    Arrow,
    /// JSON rows
    Rows,
    /// DataFusion DataFrame
    DataFrame,
}

impl FromStr for ReturnType {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "arrow" | "columnar" => Ok(ReturnType::Arrow),
            "rows" | "json" | "row-major" => Ok(ReturnType::Rows),
            "dataframe" | "datafusion" => Ok(ReturnType::DataFrame),
            _ => Err(PoolError::InvalidArgument(format!(
                "return_type must be one of arrow, rows, dataframe; got {}",
                s
            ))),
        }
    }
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReturnType::Arrow => "arrow",
            ReturnType::Rows => "rows",
            ReturnType::DataFrame => "dataframe",
        };
        f.write_str(name)
    }
}

/// Final result of a read, shaped according to [`ReturnType`].
#[derive(Debug)]
pub enum Table {
    Arrow(MergedTable),
    Rows(QueryResult),
    DataFrame(DataFrame),
}

impl Table {
    pub fn return_type(&self) -> ReturnType {
        match self {
            Table::Arrow(_) => ReturnType::Arrow,
            Table::Rows(_) => ReturnType::Rows,
            Table::DataFrame(_) => ReturnType::DataFrame,
        }
    }

    pub fn into_arrow(self) -> Option<MergedTable> {
        match self {
            Table::Arrow(table) => Some(table),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Option<QueryResult> {
        match self {
            Table::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn into_dataframe(self) -> Option<DataFrame> {
        match self {
            Table::DataFrame(df) => Some(df),
            _ => None,
        }
    }
}
