// Deterministic merge of per-partition batches into one table
use std::sync::Arc;

use datafusion::arrow::array::ArrayRef;
use datafusion::arrow::compute::{cast, sort_to_indices, take, SortOptions};
use datafusion::arrow::datatypes::{Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;

use crate::error::{PoolError, Result};
use crate::models::MergedTable;
use crate::services::database::LogicalType;
use crate::services::dispatcher::PartitionResult;

pub struct Merger;

impl Merger {
    /// Concatenate partition results in ascending partition index.
    ///
    /// Partitions that came back without any column description (no rows and no
    /// columns) contribute nothing and take no part in schema reconciliation.
    pub fn merge(mut results: Vec<PartitionResult>) -> Result<MergedTable> {
        let partitions = results.len();
        results.sort_by_key(|r| r.index);
        let described: Vec<PartitionResult> = results
            .into_iter()
            .filter(|r| !(r.batches.schema.fields().is_empty() && r.batches.num_rows() == 0))
            .collect();

        let schema = match described.first() {
            Some(first) => described.iter().skip(1).try_fold(
                first.batches.schema.clone(),
                |schema, result| reconcile(&schema, &result.batches.schema, result.index),
            )?,
            None => {
                return Ok(MergedTable::new(Arc::new(Schema::empty()), Vec::new())
                    .with_partitions(partitions))
            }
        };

        let mut batches = Vec::new();
        for result in described {
            for batch in result.batches.batches {
                if batch.num_rows() > 0 {
                    batches.push(conform(batch, &schema)?);
                }
            }
        }

        Ok(MergedTable::new(schema, batches).with_partitions(partitions))
    }

    /// Sort the merged rows by `column`, nulls first.
    pub fn sort_by_column(table: MergedTable, column: &str) -> Result<MergedTable> {
        let schema = table.schema();
        let name = unqualified(column);
        let position = schema
            .fields()
            .iter()
            .position(|f| f.name() == &name || f.name().eq_ignore_ascii_case(&name))
            .ok_or_else(|| {
                PoolError::InvalidArgument(format!(
                    "order_by_partition: column {} is not part of the result",
                    column
                ))
            })?;
        if table.num_rows() == 0 {
            return Ok(table);
        }

        let partitions = table.partitions();
        let combined = table.concat()?;
        let indices = sort_to_indices(
            combined.column(position).as_ref(),
            Some(SortOptions {
                descending: false,
                nulls_first: true,
            }),
            None,
        )?;
        let columns = combined
            .columns()
            .iter()
            .map(|column| take(column.as_ref(), &indices, None))
            .collect::<std::result::Result<Vec<ArrayRef>, _>>()?;
        let sorted = RecordBatch::try_new(schema.clone(), columns)?;
        Ok(MergedTable::new(schema, vec![sorted]).with_partitions(partitions))
    }
}

/// Unify two partition schemas column by column.
///
/// Types widen exactly as they do between rows of one partition, so splitting a
/// read never changes its result type.
fn reconcile(current: &SchemaRef, next: &SchemaRef, partition: usize) -> Result<SchemaRef> {
    if current.fields().len() != next.fields().len() {
        return Err(PoolError::SchemaMismatch(format!(
            "partition {} returned {} columns, expected {}",
            partition,
            next.fields().len(),
            current.fields().len()
        )));
    }

    let fields = current
        .fields()
        .iter()
        .zip(next.fields().iter())
        .map(|(left, right)| {
            if left.name() != right.name() {
                return Err(PoolError::SchemaMismatch(format!(
                    "partition {} returned column {} where {} was expected",
                    partition,
                    right.name(),
                    left.name()
                )));
            }
            let (l, r) = (left.data_type(), right.data_type());
            let data_type = if l == r {
                l.clone()
            } else {
                match (LogicalType::from_data_type(l), LogicalType::from_data_type(r)) {
                    (Some(a), Some(b)) => a.unify(b).data_type(),
                    _ => {
                        return Err(PoolError::SchemaMismatch(format!(
                            "column {} is {} in one partition and {} in partition {}",
                            left.name(),
                            l,
                            r,
                            partition
                        )))
                    }
                }
            };
            Ok(Field::new(
                left.name(),
                data_type,
                left.is_nullable() || right.is_nullable(),
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Arc::new(Schema::new(fields)))
}

fn conform(batch: RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
    if batch.schema() == *schema {
        return Ok(batch);
    }
    let columns = batch
        .columns()
        .iter()
        .zip(schema.fields().iter())
        .map(|(column, field)| {
            if column.data_type() == field.data_type() {
                Ok(column.clone())
            } else {
                cast(column.as_ref(), field.data_type())
            }
        })
        .collect::<std::result::Result<Vec<ArrayRef>, _>>()?;
    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

/// Last component of a possibly qualified, possibly quoted column reference.
fn unqualified(column: &str) -> String {
    let last = column.rsplit('.').next().unwrap_or(column).trim();
    last.trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']')
        .to_string()
}
