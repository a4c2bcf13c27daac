use serde::{Deserialize, Serialize};

/// One contiguous slice of the partition column's domain.
///
/// `index` fixes the output position of the partition's rows in the merged table.
/// Partitions of one plan never overlap, and together they cover the planned range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub index: usize,
    pub column: String,
    pub lower_bound: i64,
    /// Exclusive for every partition except the last one, where it is inclusive.
    pub upper_bound: i64,
    pub upper_inclusive: bool,
    /// Also accept rows whose partition column is NULL.
    pub include_nulls: bool,
}

impl PartitionDescriptor {
    /// SQL predicate selecting this partition's rows.
    pub fn predicate(&self) -> String {
        let upper_op = if self.upper_inclusive { "<=" } else { "<" };
        let range = format!(
            "{col} >= {lower} AND {col} {op} {upper}",
            col = self.column,
            lower = self.lower_bound,
            op = upper_op,
            upper = self.upper_bound,
        );
        if self.include_nulls {
            format!("({}) OR {} IS NULL", range, self.column)
        } else {
            range
        }
    }
}

/// One unit of work for the dispatcher: the SQL to run and, for partitioned
/// reads, the partition it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubQuery {
    pub index: usize,
    pub sql: String,
    pub partition: Option<PartitionDescriptor>,
}

impl SubQuery {
    pub fn predicate(&self) -> Option<String> {
        self.partition.as_ref().map(PartitionDescriptor::predicate)
    }
}

/// Caller-facing partitioning request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub column: String,
    /// Inclusive `(lower, upper)` range; inferred from the data when absent.
    #[serde(default)]
    pub range: Option<(i64, i64)>,
    pub num: usize,
}
