use serde::{Deserialize, Serialize};

use super::partition::PartitionSpec;
use super::table::ReturnType;
use crate::error::{PoolError, Result};
use crate::services::database::Protocol;

/// Per-call options for [`crate::services::read_sql`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub partition_on: Option<String>,
    pub partition_range: Option<(i64, i64)>,
    pub partition_num: Option<usize>,
    pub return_type: ReturnType,
    /// Overrides the pool's default protocol for this call only.
    pub protocol: Option<Protocol>,
    /// Statements run on every leased connection before its sub-query.
    pub pre_execution_queries: Vec<String>,
    /// Sort the merged rows by the partition column.
    pub order_by_partition: bool,
    /// Compare the merged row count against a `COUNT(*)` of the base query.
    pub validate_row_count: bool,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition_on(mut self, column: impl Into<String>) -> Self {
        self.partition_on = Some(column.into());
        self
    }

    pub fn partition_range(mut self, lower: i64, upper: i64) -> Self {
        self.partition_range = Some((lower, upper));
        self
    }

    pub fn partition_num(mut self, num: usize) -> Self {
        self.partition_num = Some(num);
        self
    }

    pub fn return_type(mut self, return_type: ReturnType) -> Self {
        self.return_type = return_type;
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn pre_execution_query(mut self, sql: impl Into<String>) -> Self {
        self.pre_execution_queries.push(sql.into());
        self
    }

    pub fn order_by_partition(mut self, enabled: bool) -> Self {
        self.order_by_partition = enabled;
        self
    }

    pub fn validate_row_count(mut self, enabled: bool) -> Self {
        self.validate_row_count = enabled;
        self
    }

    /// Resolve the partition arguments into a spec, or `None` for a plain read.
    pub fn partition_spec(&self) -> Result<Option<PartitionSpec>> {
        match (&self.partition_on, self.partition_num) {
            (Some(column), Some(num)) => Ok(Some(PartitionSpec {
                column: column.clone(),
                range: self.partition_range,
                num,
            })),
            (Some(column), None) => Err(PoolError::InvalidArgument(format!(
                "partition_num is required when partitioning on {}",
                column
            ))),
            (None, Some(num)) if num > 1 => Err(PoolError::InvalidArgument(format!(
                "partition_num ({}) given without partition_on",
                num
            ))),
            (None, _) if self.partition_range.is_some() => Err(PoolError::InvalidArgument(
                "partition_range given without partition_on".to_string(),
            )),
            (None, _) => Ok(None),
        }
    }
}

/// Body of `POST /api/query`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub connection_url: String,
    pub query: String,
    #[serde(default)]
    pub partition_on: Option<String>,
    #[serde(default)]
    pub partition_range: Option<(i64, i64)>,
    #[serde(default)]
    pub partition_num: Option<usize>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub pre_execution_queries: Vec<String>,
    #[serde(default)]
    pub order_by_partition: bool,
}

/// Body returned by `POST /api/query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub partitions: usize,
    pub execution_time_ms: u64,
}

/// Body of `DELETE /api/pools`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClosePoolRequest {
    pub connection_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_read_has_no_partition_spec() {
        assert!(ReadOptions::new().partition_spec().unwrap().is_none());
        assert!(ReadOptions::new()
            .partition_num(1)
            .partition_spec()
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_partition_spec_from_options() {
        let spec = ReadOptions::new()
            .partition_on("a")
            .partition_range(0, 6)
            .partition_num(3)
            .partition_spec()
            .unwrap()
            .unwrap();
        assert_eq!(spec.column, "a");
        assert_eq!(spec.range, Some((0, 6)));
        assert_eq!(spec.num, 3);
    }

    #[test]
    fn test_partition_on_requires_partition_num() {
        let err = ReadOptions::new().partition_on("a").partition_spec().unwrap_err();
        assert!(err.to_string().contains("partition_num"));
    }

    #[test]
    fn test_partition_num_requires_column() {
        let err = ReadOptions::new().partition_num(4).partition_spec().unwrap_err();
        assert!(matches!(err, PoolError::InvalidArgument(_)));
    }
}
