// Capability interface every backend connection implements.
use datafusion::arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray};
use datafusion::arrow::datatypes::DataType;

use super::batch::ColumnBatches;
use super::{Backend, Protocol};
use crate::error::{PoolError, Result};

/// One live link to a backend.
///
/// Implementations own their driver handle exclusively; the pool never shares a
/// connection between two leases, so every method takes `&mut self`.
#[async_trait::async_trait]
pub trait SourceConnection: Send {
    /// Run a query and collect its result as typed column batches.
    async fn execute(
        &mut self,
        sql: &str,
        protocol: Protocol,
        batch_size: usize,
    ) -> Result<ColumnBatches>;

    /// Run statements that produce no result (session settings and the like).
    async fn batch_execute(&mut self, sql: &str) -> Result<()>;

    /// Cheap liveness probe used on checkout.
    async fn ping(&mut self) -> bool;

    /// True once the underlying link is known to be dead.
    fn is_broken(&self) -> bool;

    fn backend(&self) -> Backend;

    /// Smallest and largest value of `column` over the rows of `query`.
    ///
    /// Returns `None` when the query yields no non-null value.
    async fn infer_range(
        &mut self,
        query: &str,
        column: &str,
        protocol: Protocol,
    ) -> Result<Option<(i64, i64)>> {
        let sql = format!(
            "SELECT MIN({col}) AS cx_min, MAX({col}) AS cx_max FROM ({query}) AS cx_range",
            col = column,
            query = query,
        );
        let result = self.execute(&sql, protocol, 1).await?;
        let batch = match result.batches.iter().find(|b| b.num_rows() > 0) {
            Some(batch) => batch,
            None => return Ok(None),
        };
        if batch.num_columns() != 2 {
            return Err(PoolError::execution(format!(
                "range query returned {} columns",
                batch.num_columns()
            )));
        }

        let min = scalar_bound(column, batch.column(0), Rounding::Floor)?;
        let max = scalar_bound(column, batch.column(1), Rounding::Ceil)?;
        match (min, max) {
            (Some(min), Some(max)) => Ok(Some((min, max))),
            _ => Ok(None),
        }
    }

    /// Number of rows `query` returns.
    async fn count_rows(&mut self, query: &str, protocol: Protocol) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) AS cx_count FROM ({}) AS cx_count_subq", query);
        let result = self.execute(&sql, protocol, 1).await?;
        let batch = result
            .batches
            .iter()
            .find(|b| b.num_rows() > 0)
            .ok_or_else(|| PoolError::execution("count query returned no rows"))?;
        let count = scalar_bound("COUNT(*)", batch.column(0), Rounding::Floor)?
            .ok_or_else(|| PoolError::execution("count query returned NULL"))?;
        usize::try_from(count)
            .map_err(|_| PoolError::execution(format!("invalid row count {}", count)))
    }
}

#[derive(Debug, Clone, Copy)]
enum Rounding {
    Floor,
    Ceil,
}

/// Read the first value of a single-row aggregate as an integer bound.
fn scalar_bound(column: &str, array: &ArrayRef, rounding: Rounding) -> Result<Option<i64>> {
    if array.data_type() == &DataType::Null || array.is_null(0) {
        return Ok(None);
    }
    match array.data_type() {
        DataType::Int64 => Ok(array
            .as_any()
            .downcast_ref::<Int64Array>()
            .map(|a| a.value(0))),
        DataType::Float64 => match array.as_any().downcast_ref::<Float64Array>() {
            Some(a) => float_bound(column, a.value(0), rounding).map(Some),
            None => Ok(None),
        },
        // Text protocols hand numbers back as strings.
        DataType::Utf8 => {
            let text = array
                .as_any()
                .downcast_ref::<StringArray>()
                .map(|a| a.value(0).trim().to_string())
                .unwrap_or_default();
            if let Ok(v) = text.parse::<i64>() {
                return Ok(Some(v));
            }
            match text.parse::<f64>() {
                Ok(v) => float_bound(column, v, rounding).map(Some),
                Err(_) => Err(not_orderable(column, array.data_type())),
            }
        }
        other => Err(not_orderable(column, other)),
    }
}

/// Round a float bound outward, refusing NaN, infinities and values outside `i64`.
fn float_bound(column: &str, value: f64, rounding: Rounding) -> Result<i64> {
    let rounded = match rounding {
        Rounding::Floor => value.floor(),
        Rounding::Ceil => value.ceil(),
    };
    if !rounded.is_finite() || rounded < i64::MIN as f64 || rounded >= i64::MAX as f64 {
        return Err(PoolError::InvalidArgument(format!(
            "partition column {} has a bound {} that does not fit a 64-bit integer",
            column, value
        )));
    }
    Ok(rounded as i64)
}

fn not_orderable(column: &str, data_type: &DataType) -> PoolError {
    PoolError::InvalidArgument(format!(
        "partition column {} is not an orderable numeric column (found {})",
        column, data_type
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_scalar_bound_rounds_floats_outward() {
        let array: ArrayRef = Arc::new(Float64Array::from(vec![1.5]));
        assert_eq!(scalar_bound("x", &array, Rounding::Floor).unwrap(), Some(1));
        assert_eq!(scalar_bound("x", &array, Rounding::Ceil).unwrap(), Some(2));
    }

    #[test]
    fn test_scalar_bound_rejects_non_finite_floats() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1e30] {
            let array: ArrayRef = Arc::new(Float64Array::from(vec![value]));
            let err = scalar_bound("x", &array, Rounding::Floor).unwrap_err();
            assert!(matches!(err, PoolError::InvalidArgument(_)), "{}", value);
        }
        let array: ArrayRef = Arc::new(StringArray::from(vec!["inf"]));
        assert!(scalar_bound("x", &array, Rounding::Ceil).is_err());
    }

    #[test]
    fn test_scalar_bound_parses_text_numbers() {
        let array: ArrayRef = Arc::new(StringArray::from(vec!["42"]));
        assert_eq!(scalar_bound("x", &array, Rounding::Floor).unwrap(), Some(42));
    }

    #[test]
    fn test_scalar_bound_rejects_text_values() {
        let array: ArrayRef = Arc::new(StringArray::from(vec!["abc"]));
        let err = scalar_bound("name", &array, Rounding::Floor).unwrap_err();
        assert!(matches!(err, PoolError::InvalidArgument(_)));
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_scalar_bound_null_is_none() {
        let array: ArrayRef = Arc::new(Int64Array::from(vec![None::<i64>]));
        assert_eq!(scalar_bound("x", &array, Rounding::Floor).unwrap(), None);
    }
}
