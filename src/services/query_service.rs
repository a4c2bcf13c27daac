// Partitioned read: validate, plan, dispatch, merge, adapt
use std::sync::Arc;
use std::time::Instant;

use crate::error::{PoolError, Result};
use crate::models::{ReadOptions, SubQuery, Table};
use crate::services::connection_pool::ConnectionPool;
use crate::services::converter::ResultConverter;
use crate::services::database::{SourceConn, SourceConnection};
use crate::services::dispatcher::{Dispatcher, ExecutionSettings, LeaseSource};
use crate::services::merger::Merger;
use crate::services::partition_planner::PartitionPlanner;
use crate::validation::SqlValidator;

/// What a read runs against.
#[derive(Debug, Clone)]
pub enum ReadSource {
    Pool(ConnectionPool),
    /// Connection string; every partition opens and drops its own connection.
    Descriptor(String),
}

impl From<ConnectionPool> for ReadSource {
    fn from(pool: ConnectionPool) -> Self {
        ReadSource::Pool(pool)
    }
}

impl From<&ConnectionPool> for ReadSource {
    fn from(pool: &ConnectionPool) -> Self {
        ReadSource::Pool(pool.clone())
    }
}

impl From<&str> for ReadSource {
    fn from(conn: &str) -> Self {
        ReadSource::Descriptor(conn.to_string())
    }
}

impl From<String> for ReadSource {
    fn from(conn: String) -> Self {
        ReadSource::Descriptor(conn)
    }
}

impl ReadSource {
    fn into_lease_source(self) -> Result<LeaseSource> {
        match self {
            ReadSource::Pool(pool) => {
                if pool.is_closed() {
                    return Err(PoolError::PoolClosed);
                }
                Ok(LeaseSource::Pool(pool))
            }
            ReadSource::Descriptor(conn) => Ok(LeaseSource::OneShot(Arc::new(SourceConn::parse(&conn)?))),
        }
    }
}

/// Run `query` against `source`, optionally split into range partitions.
///
/// Every argument is checked before a connection is opened: a bad column, an
/// inverted range or a `partition_num` above the pool's `max_size` fails without
/// touching the backend.
pub async fn read_sql(
    source: impl Into<ReadSource>,
    query: &str,
    options: ReadOptions,
) -> Result<Table> {
    let start_time = Instant::now();
    let source: ReadSource = source.into();
    let source = source.into_lease_source()?;
    let backend = source.backend();

    // Dialects are not Send; keep them out of any await.
    let (base_sql, spec, range_column) = {
        let dialect = backend.dialect();
        let base_sql = SqlValidator::validate_select_only(query, dialect.as_ref())?;
        let spec = options.partition_spec()?;
        let mut range_column = None;
        if let Some(spec) = &spec {
            PartitionPlanner::validate(spec, source.max_size(), dialect.as_ref())?;
            range_column = Some(SqlValidator::output_column(&spec.column, dialect.as_ref())?);
        }
        (base_sql, spec, range_column)
    };

    let protocol = options.protocol.unwrap_or_else(|| source.default_protocol());
    backend.check_protocol(protocol)?;
    let settings = ExecutionSettings {
        protocol,
        batch_size: source.batch_size(),
        pre_execution_queries: Arc::new(options.pre_execution_queries.clone()),
    };

    let subqueries: Vec<SubQuery> = match &spec {
        Some(spec) if spec.num > 1 || spec.range.is_some() => {
            let (range, inferred) = match spec.range {
                Some(range) => (Some(range), false),
                None => {
                    // The range query nests the base query, so only its output name resolves.
                    let column = range_column.as_deref().unwrap_or(spec.column.as_str());
                    let mut lease = source.lease().await?;
                    let range = lease.infer_range(&base_sql, column, protocol).await?;
                    tracing::debug!("Inferred range for {}: {:?}", spec.column, range);
                    (range, true)
                }
            };
            PartitionPlanner::plan(&base_sql, spec, range, inferred, backend.dialect().as_ref())?
        }
        _ => vec![PartitionPlanner::unpartitioned(&base_sql)],
    };
    let partitions = subqueries.len();

    let results = Dispatcher::dispatch(&source, subqueries, &settings).await?;
    let mut merged = Merger::merge(results)?;

    if options.order_by_partition {
        if let Some(spec) = &spec {
            merged = Merger::sort_by_column(merged, &spec.column)?;
        }
    }

    if options.validate_row_count {
        let mut lease = source.lease().await?;
        let expected = lease.count_rows(&base_sql, protocol).await?;
        let actual = merged.num_rows();
        if expected != actual {
            return Err(PoolError::RowCountMismatch { expected, actual });
        }
    }

    tracing::info!(
        "Read {} rows from {} in {} partition(s) in {} ms",
        merged.num_rows(),
        backend,
        partitions,
        start_time.elapsed().as_millis()
    );

    ResultConverter::adapt(merged, options.return_type)
}
