use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use serde::Serialize;

use crate::error::Result;
use crate::services::connection_pool::{ConnectionPool, PoolConfig, PoolStatus};
use crate::services::database::mask_credentials;

/// Connection pool manager that maintains pools for multiple database connections
/// Each connection string gets its own dedicated pool, created on first use
pub struct ConnectionPoolManager {
    pools: Arc<RwLock<HashMap<String, ConnectionPool>>>,
    config: PoolConfig,
}

/// Status of one managed pool, keyed by its masked connection string
#[derive(Debug, Clone, Serialize)]
pub struct ManagedPoolStatus {
    pub connection_url: String,
    pub backend: String,
    pub protocol: String,
    #[serde(flatten)]
    pub status: PoolStatus,
}

impl ConnectionPoolManager {
    /// Create a new connection pool manager with default settings
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Create a connection pool manager with custom pool settings
    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Get or create a connection pool for the given connection URL
    /// This method is safe to call concurrently from multiple tasks
    pub async fn get_or_create_pool(&self, connection_url: &str) -> Result<ConnectionPool> {
        // Fast path: check if pool already exists (read lock)
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(connection_url) {
                if !pool.is_closed() {
                    tracing::debug!(
                        "Using existing connection pool for: {}",
                        mask_credentials(connection_url)
                    );
                    return Ok(pool.clone());
                }
            }
        }

        // Slow path: create new pool (write lock)
        let mut pools = self.pools.write().await;

        // Double-check in case another task created the pool while we were waiting
        if let Some(pool) = pools.get(connection_url) {
            if !pool.is_closed() {
                tracing::debug!(
                    "Pool created by another task for: {}",
                    mask_credentials(connection_url)
                );
                return Ok(pool.clone());
            }
        }

        let pool = ConnectionPool::open(connection_url, self.config.clone()).map_err(|e| {
            tracing::error!("Failed to create connection pool: {}", e);
            e
        })?;
        pools.insert(connection_url.to_string(), pool.clone());

        Ok(pool)
    }

    /// Close and forget the pool for `connection_url`
    pub async fn remove_pool(&self, connection_url: &str) -> bool {
        let mut pools = self.pools.write().await;
        match pools.remove(connection_url) {
            Some(pool) => {
                pool.close();
                tracing::info!("Removed connection pool for: {}", pool.conn_str());
                true
            }
            None => false,
        }
    }

    /// Close every managed pool
    pub async fn close_all(&self) {
        let mut pools = self.pools.write().await;
        for (_, pool) in pools.drain() {
            pool.close();
        }
    }

    /// Get the number of active pools
    pub async fn pool_count(&self) -> usize {
        let pools = self.pools.read().await;
        pools.len()
    }

    /// Statuses of all managed pools, sorted by masked URL
    pub async fn statuses(&self) -> Vec<ManagedPoolStatus> {
        let pools = self.pools.read().await;
        let mut statuses: Vec<ManagedPoolStatus> = pools
            .values()
            .map(|pool| ManagedPoolStatus {
                connection_url: pool.conn_str(),
                backend: pool.backend().to_string(),
                protocol: pool.default_protocol().to_string(),
                status: pool.status(),
            })
            .collect();
        statuses.sort_by(|a, b| a.connection_url.cmp(&b.connection_url));
        statuses
    }
}

impl Default for ConnectionPoolManager {
    fn default() -> Self {
        Self::new()
    }
}
