// Concurrent execution of planned sub-queries, one lease per partition
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;

use crate::error::{PoolError, Result};
use crate::models::SubQuery;
use crate::services::connection_pool::{ConnectionPool, Lease, PoolConfig};
use crate::services::database::{Backend, ColumnBatches, Protocol, SourceConn, SourceConnection};

/// Where leases come from: a shared pool, or a fresh connection per use.
#[derive(Clone)]
pub enum LeaseSource {
    Pool(ConnectionPool),
    OneShot(Arc<SourceConn>),
}

impl LeaseSource {
    pub async fn lease(&self) -> Result<Lease> {
        match self {
            LeaseSource::Pool(pool) => pool.acquire().await,
            LeaseSource::OneShot(source) => Lease::one_shot(source).await,
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            LeaseSource::Pool(pool) => pool.backend(),
            LeaseSource::OneShot(source) => source.backend,
        }
    }

    pub fn default_protocol(&self) -> Protocol {
        match self {
            LeaseSource::Pool(pool) => pool.default_protocol(),
            LeaseSource::OneShot(source) => source.protocol,
        }
    }

    /// Pool capacity; the one-shot path has no cap.
    pub fn max_size(&self) -> Option<usize> {
        match self {
            LeaseSource::Pool(pool) => Some(pool.max_size()),
            LeaseSource::OneShot(_) => None,
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            LeaseSource::Pool(pool) => pool.config().batch_size,
            LeaseSource::OneShot(_) => PoolConfig::default().batch_size,
        }
    }
}

/// Per-read execution settings shared by every partition.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub protocol: Protocol,
    pub batch_size: usize,
    pub pre_execution_queries: Arc<Vec<String>>,
}

/// Batches produced by one sub-query.
#[derive(Debug, Clone)]
pub struct PartitionResult {
    pub index: usize,
    pub batches: ColumnBatches,
}

pub struct Dispatcher;

impl Dispatcher {
    /// Run every sub-query and return one result per partition, in completion order.
    ///
    /// All tasks are drained before an error is returned so no lease outlives the call.
    pub async fn dispatch(
        source: &LeaseSource,
        subqueries: Vec<SubQuery>,
        settings: &ExecutionSettings,
    ) -> Result<Vec<PartitionResult>> {
        if let [single] = subqueries.as_slice() {
            let batches = Self::run_subquery(source, single, settings)
                .await
                .map_err(|e| e.in_partition(single.index, single.predicate().as_deref()))?;
            return Ok(vec![PartitionResult {
                index: single.index,
                batches,
            }]);
        }

        let partitions = subqueries.len();
        let mut tasks = JoinSet::new();
        for subquery in subqueries {
            let source = source.clone();
            let settings = settings.clone();
            tasks.spawn(async move {
                let outcome = Self::run_subquery(&source, &subquery, &settings).await;
                (subquery, outcome)
            });
        }

        let mut results = Vec::with_capacity(partitions);
        let mut first_error: Option<PoolError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((subquery, Ok(batches))) => results.push(PartitionResult {
                    index: subquery.index,
                    batches,
                }),
                Ok((subquery, Err(e))) => {
                    tracing::warn!("Partition {} failed: {}", subquery.index, e);
                    if first_error.is_none() {
                        first_error =
                            Some(e.in_partition(subquery.index, subquery.predicate().as_deref()));
                    }
                }
                Err(e) => {
                    tracing::error!("Partition task failed: {}", e);
                    if first_error.is_none() {
                        first_error =
                            Some(PoolError::execution(format!("partition task failed: {}", e)));
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    async fn run_subquery(
        source: &LeaseSource,
        subquery: &SubQuery,
        settings: &ExecutionSettings,
    ) -> Result<ColumnBatches> {
        let mut lease = source.lease().await?;
        for statement in settings.pre_execution_queries.iter() {
            lease.batch_execute(statement).await?;
        }

        let start_time = Instant::now();
        let result = lease
            .execute(&subquery.sql, settings.protocol, settings.batch_size)
            .await?;
        tracing::debug!(
            "Partition {} returned {} rows in {} ms",
            subquery.index,
            result.num_rows(),
            start_time.elapsed().as_millis()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sqlite_pool(dir: &TempDir, max_size: usize) -> ConnectionPool {
        let path = dir.path().join("dispatch.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (a INTEGER);
             INSERT INTO t VALUES (0), (1), (2), (3);",
        )
        .unwrap();
        ConnectionPool::open(
            &format!("sqlite://{}", path.display()),
            PoolConfig::new(max_size),
        )
        .unwrap()
    }

    fn settings() -> ExecutionSettings {
        ExecutionSettings {
            protocol: Protocol::Binary,
            batch_size: 1024,
            pre_execution_queries: Arc::new(Vec::new()),
        }
    }

    fn subquery(index: usize, sql: &str) -> SubQuery {
        SubQuery {
            index,
            sql: sql.to_string(),
            partition: None,
        }
    }

    #[tokio::test]
    async fn test_dispatch_runs_every_partition() {
        let dir = TempDir::new().unwrap();
        let pool = sqlite_pool(&dir, 2);
        let source = LeaseSource::Pool(pool.clone());

        let subqueries = vec![
            subquery(0, "SELECT a FROM t WHERE a < 2"),
            subquery(1, "SELECT a FROM t WHERE a >= 2"),
        ];
        let mut results = Dispatcher::dispatch(&source, subqueries, &settings())
            .await
            .unwrap();
        results.sort_by_key(|r| r.index);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].batches.num_rows(), 2);
        assert_eq!(results[1].batches.num_rows(), 2);
        assert_eq!(pool.status().leased, 0);
    }

    #[tokio::test]
    async fn test_failure_names_the_partition_and_releases_leases() {
        let dir = TempDir::new().unwrap();
        let pool = sqlite_pool(&dir, 3);
        let source = LeaseSource::Pool(pool.clone());

        let subqueries = vec![
            subquery(0, "SELECT a FROM t"),
            subquery(1, "SELECT missing_column FROM t"),
            subquery(2, "SELECT a FROM t"),
        ];
        let err = Dispatcher::dispatch(&source, subqueries, &settings())
            .await
            .unwrap_err();

        match err {
            PoolError::Execution { partition, .. } => assert_eq!(partition, Some(1)),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(pool.status().leased, 0);
    }

    #[tokio::test]
    async fn test_pre_execution_queries_run_first() {
        let dir = TempDir::new().unwrap();
        let pool = sqlite_pool(&dir, 1);
        let source = LeaseSource::Pool(pool);
        let settings = ExecutionSettings {
            pre_execution_queries: Arc::new(vec!["PRAGMA cache_size = 100".to_string()]),
            ..settings()
        };

        let results = Dispatcher::dispatch(&source, vec![subquery(0, "PRAGMA cache_size")], &settings)
            .await
            .unwrap();
        assert_eq!(results[0].batches.num_rows(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_error_passes_through() {
        let dir = TempDir::new().unwrap();
        let pool = sqlite_pool(&dir, 1);
        pool.close();
        let source = LeaseSource::Pool(pool);

        let err = Dispatcher::dispatch(&source, vec![subquery(0, "SELECT a FROM t")], &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::PoolClosed));
    }
}
