// Bounded pool of backend connections for one connection string
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::services::database::{
    Backend, ColumnBatches, Connection, Protocol, SourceConn, SourceConnection,
};

/// Pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_size: usize,
    /// Idle connections unused for longer than this are closed.
    pub idle_timeout: Option<Duration>,
    /// Connections older than this are closed instead of being reused.
    pub max_lifetime: Option<Duration>,
    /// Longest `acquire` may wait for a free slot.
    pub connection_timeout: Duration,
    /// Ping idle connections before handing them out.
    pub test_on_check_out: bool,
    /// Rows per record batch.
    pub batch_size: usize,
    /// Overrides the protocol given in the connection string.
    pub protocol: Option<Protocol>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: num_cpus::get().max(1),
            idle_timeout: Some(Duration::from_secs(300)),
            max_lifetime: Some(Duration::from_secs(1800)),
            connection_timeout: Duration::from_secs(30),
            test_on_check_out: true,
            batch_size: 8192,
            protocol: None,
        }
    }
}

impl PoolConfig {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Self::default()
        }
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn with_test_on_check_out(mut self, enabled: bool) -> Self {
        self.test_on_check_out = enabled;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size < 1 {
            return Err(PoolError::Configuration(format!(
                "max_size must be at least 1, got {}",
                self.max_size
            )));
        }
        if self.batch_size < 1 {
            return Err(PoolError::Configuration(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(PoolError::Configuration(
                "connection_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connection pool status information
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_size: usize,
    /// Live connections, idle or leased.
    pub size: usize,
    pub idle: usize,
    pub leased: usize,
    /// Connections established over the pool's lifetime.
    pub opened: u64,
    pub closed: bool,
}

struct IdleConnection {
    conn: Connection,
    created_at: Instant,
    last_used: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleConnection>,
    size: usize,
    leased: usize,
    opened: u64,
    closed: bool,
}

struct PoolInner {
    id: Uuid,
    source: SourceConn,
    config: PoolConfig,
    state: Mutex<PoolState>,
    semaphore: Arc<Semaphore>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Counters stay consistent across a panic in another holder
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_expired(&self, created_at: Instant, last_used: Instant) -> bool {
        let too_old = self
            .config
            .max_lifetime
            .is_some_and(|lifetime| created_at.elapsed() >= lifetime);
        let too_idle = self
            .config
            .idle_timeout
            .is_some_and(|timeout| last_used.elapsed() >= timeout);
        too_old || too_idle
    }

    /// Remove expired idle connections; the caller drops them outside the lock.
    fn evict_idle_locked(&self, state: &mut PoolState) -> Vec<Connection> {
        let mut evicted = Vec::new();
        let mut kept = VecDeque::with_capacity(state.idle.len());
        while let Some(idle) = state.idle.pop_front() {
            if self.is_expired(idle.created_at, idle.last_used) {
                evicted.push(idle.conn);
            } else {
                kept.push_back(idle);
            }
        }
        state.idle = kept;
        state.size -= evicted.len();
        evicted
    }

    async fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::connect(&self.source).await.map_err(|e| {
            tracing::warn!("Pool {} failed to open a connection: {}", self.id, e);
            e
        })?;
        let mut state = self.lock();
        state.opened += 1;
        tracing::debug!(
            "Pool {} opened connection {} of {}",
            self.id,
            state.size,
            self.config.max_size
        );
        Ok(conn)
    }

    fn release(&self, conn: Connection, created_at: Instant) {
        let discard = {
            let mut state = self.lock();
            state.leased -= 1;
            let expired = self
                .config
                .max_lifetime
                .is_some_and(|lifetime| created_at.elapsed() >= lifetime);
            if state.closed || conn.is_broken() || expired {
                state.size -= 1;
                Some(conn)
            } else {
                state.idle.push_back(IdleConnection {
                    conn,
                    created_at,
                    last_used: Instant::now(),
                });
                None
            }
        };
        if discard.is_some() {
            tracing::debug!("Pool {} discarded a returned connection", self.id);
        }
    }
}

/// Slot taken by an acquire that has not produced a lease yet. Dropping it armed
/// (connect failure or a cancelled acquire) gives the slot back.
struct Reservation {
    inner: Arc<PoolInner>,
    armed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.lock();
            state.leased -= 1;
            state.size -= 1;
        }
    }
}

/// A bounded set of reusable connections to one backend.
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create an open pool. No backend connection is made until the first acquire.
    pub fn open(conn: &str, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let mut source = SourceConn::parse(conn)?;
        if !source.backend.supports_pooling() {
            return Err(PoolError::Configuration(format!(
                "{} does not support connection pooling",
                source.backend
            )));
        }
        if let Some(protocol) = config.protocol {
            source
                .backend
                .check_protocol(protocol)
                .map_err(|e| PoolError::Configuration(e.to_string()))?;
            source.protocol = protocol;
        }

        let id = Uuid::new_v4();
        tracing::info!(
            "Creating connection pool {} for: {} (max_size: {}, protocol: {})",
            id,
            source.masked(),
            config.max_size,
            source.protocol
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                id,
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                source,
                config,
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn max_size(&self) -> usize {
        self.inner.config.max_size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn default_protocol(&self) -> Protocol {
        self.inner.source.protocol
    }

    pub fn backend(&self) -> Backend {
        self.inner.source.backend
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Connection string with credentials masked.
    pub fn conn_str(&self) -> String {
        self.inner.source.masked()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        PoolStatus {
            max_size: self.inner.config.max_size,
            size: state.size,
            idle: state.idle.len(),
            leased: state.leased,
            opened: state.opened,
            closed: state.closed,
        }
    }

    /// Lease a connection, waiting up to `connection_timeout` for a free slot.
    pub async fn acquire(&self) -> Result<Lease> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let timeout = self.inner.config.connection_timeout;
        let permit =
            match tokio::time::timeout(timeout, self.inner.semaphore.clone().acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::PoolClosed),
                Err(_) => {
                    return Err(PoolError::AcquireTimeout {
                        max_size: self.inner.config.max_size,
                        timeout_ms: timeout.as_millis(),
                    })
                }
            };

        let (idle, evicted) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            let evicted = self.inner.evict_idle_locked(&mut state);
            let idle = state.idle.pop_back();
            if idle.is_none() {
                // Reserve the slot before connecting outside the lock
                state.size += 1;
            }
            state.leased += 1;
            (idle, evicted)
        };
        drop(evicted);

        let mut reservation = Reservation {
            inner: self.inner.clone(),
            armed: true,
        };
        let (conn, created_at) = self.checkout(idle).await?;
        reservation.armed = false;

        Ok(Lease {
            conn: Some(conn),
            backend: self.inner.source.backend,
            created_at,
            pool: Some(self.inner.clone()),
            _permit: Some(permit),
        })
    }

    async fn checkout(&self, idle: Option<IdleConnection>) -> Result<(Connection, Instant)> {
        if let Some(mut idle) = idle {
            if !self.inner.config.test_on_check_out || idle.conn.ping().await {
                return Ok((idle.conn, idle.created_at));
            }
            tracing::info!(
                "Pool {} replacing a connection that failed its health check",
                self.inner.id
            );
            // The reserved slot is handed over to the replacement
            drop(idle);
        }
        let conn = self.inner.open_connection().await?;
        Ok((conn, Instant::now()))
    }

    /// Close the pool. Idle connections are dropped now; leased ones when they return.
    pub fn close(&self) {
        let drained: Vec<IdleConnection> = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<IdleConnection> = state.idle.drain(..).collect();
            state.size -= drained.len();
            drained
        };
        self.inner.semaphore.close();
        tracing::info!(
            "Closed connection pool {} ({} idle connections dropped)",
            self.inner.id,
            drained.len()
        );
    }

    /// Guard that closes the pool when dropped.
    pub fn scoped(self) -> ScopedPool {
        ScopedPool { pool: self }
    }

    /// Open a pool, run `f` with it and close the pool on every exit path.
    pub async fn scope<F, Fut, T>(conn: &str, config: PoolConfig, f: F) -> Result<T>
    where
        F: FnOnce(ConnectionPool) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = ConnectionPool::open(conn, config)?.scoped();
        f(guard.pool.clone()).await
    }
}

impl fmt::Display for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionPool(max_size={}, status={})",
            self.max_size(),
            if self.is_closed() { "closed" } else { "open" }
        )
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.source.backend)
            .field("max_size", &self.inner.config.max_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Closes the wrapped pool on drop.
pub struct ScopedPool {
    pool: ConnectionPool,
}

impl ScopedPool {
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl Deref for ScopedPool {
    type Target = ConnectionPool;

    fn deref(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl Drop for ScopedPool {
    fn drop(&mut self) {
        self.pool.close();
    }
}

/// Exclusive use of one connection.
///
/// Dropping the lease hands the connection back to its pool, or discards it when
/// the link is broken or the pool has been closed. One-shot leases own their
/// connection outright and simply drop it.
pub struct Lease {
    conn: Option<Connection>,
    backend: Backend,
    created_at: Instant,
    pool: Option<Arc<PoolInner>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    /// Open an unpooled connection for a single use.
    pub async fn one_shot(source: &SourceConn) -> Result<Self> {
        let conn = Connection::connect(source).await?;
        Ok(Self {
            conn: Some(conn),
            backend: source.backend,
            created_at: Instant::now(),
            pool: None,
            _permit: None,
        })
    }

    fn conn_mut(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| PoolError::Connection("lease has already been released".to_string()))
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("backend", &self.backend)
            .field("pooled", &self.pool.is_some())
            .field("released", &self.conn.is_none())
            .finish()
    }
}

#[async_trait::async_trait]
impl SourceConnection for Lease {
    async fn execute(
        &mut self,
        sql: &str,
        protocol: Protocol,
        batch_size: usize,
    ) -> Result<ColumnBatches> {
        self.conn_mut()?.execute(sql, protocol, batch_size).await
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<()> {
        self.conn_mut()?.batch_execute(sql).await
    }

    async fn ping(&mut self) -> bool {
        match self.conn.as_mut() {
            Some(conn) => conn.ping().await,
            None => false,
        }
    }

    fn is_broken(&self) -> bool {
        self.conn.as_ref().map_or(true, |conn| conn.is_broken())
    }

    fn backend(&self) -> Backend {
        self.backend
    }

    async fn infer_range(
        &mut self,
        query: &str,
        column: &str,
        protocol: Protocol,
    ) -> Result<Option<(i64, i64)>> {
        self.conn_mut()?.infer_range(query, column, protocol).await
    }

    async fn count_rows(&mut self, query: &str, protocol: Protocol) -> Result<usize> {
        self.conn_mut()?.count_rows(query, protocol).await
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let (Some(conn), Some(pool)) = (self.conn.take(), self.pool.take()) {
            pool.release(conn, self.created_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn sqlite_db(dir: &TempDir) -> String {
        let path = dir.path().join("pool.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE t (a INTEGER); INSERT INTO t VALUES (1), (2);")
            .unwrap();
        format!("sqlite://{}", path.display())
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolConfig::new(1).validate().is_ok());
        assert!(matches!(
            PoolConfig::new(0).validate(),
            Err(PoolError::Configuration(_))
        ));
        assert!(PoolConfig::new(2).with_batch_size(0).validate().is_err());
    }

    #[test]
    fn test_open_is_lazy() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::open(&sqlite_db(&dir), PoolConfig::new(4)).unwrap();
        let status = pool.status();
        assert_eq!(status.opened, 0);
        assert_eq!(status.size, 0);
        assert!(!pool.is_closed());
        assert_eq!(pool.max_size(), 4);
        assert_eq!(pool.default_protocol(), Protocol::Binary);
    }

    #[test]
    fn test_open_rejects_druid_and_bad_sizes() {
        let err = ConnectionPool::open("druid://localhost:8082", PoolConfig::new(2)).unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));

        let err = ConnectionPool::open("sqlite:///tmp/x.db", PoolConfig::new(0)).unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));

        let err = ConnectionPool::open(
            "sqlite:///tmp/x.db",
            PoolConfig::new(2).with_protocol(Protocol::Cursor),
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
    }

    #[test]
    fn test_display() {
        let pool = ConnectionPool::open("sqlite:///tmp/x.db", PoolConfig::new(5)).unwrap();
        assert_eq!(pool.to_string(), "ConnectionPool(max_size=5, status=open)");
        pool.close();
        assert_eq!(pool.to_string(), "ConnectionPool(max_size=5, status=closed)");
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::open(&sqlite_db(&dir), PoolConfig::new(2)).unwrap();

        for _ in 0..3 {
            let mut lease = pool.acquire().await.unwrap();
            let result = lease.execute("SELECT a FROM t", Protocol::Binary, 16).await.unwrap();
            assert_eq!(result.num_rows(), 2);
        }

        let status = pool.status();
        assert_eq!(status.opened, 1);
        assert_eq!(status.idle, 1);
        assert_eq!(status.leased, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_is_never_exceeded() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::open(&sqlite_db(&dir), PoolConfig::new(2)).unwrap();
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let peak = peak.clone();
            tasks.spawn(async move {
                let _lease = pool.acquire().await.unwrap();
                peak.fetch_max(pool.status().leased, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        let status = pool.status();
        assert!(status.opened <= 2);
        assert_eq!(status.leased, 0);
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let dir = TempDir::new().unwrap();
        let config = PoolConfig::new(1).with_connection_timeout(Duration::from_millis(50));
        let pool = ConnectionPool::open(&sqlite_db(&dir), config).unwrap();

        let held = pool.acquire().await.unwrap();
        assert_eq!(
            format!("{:?}", held),
            "Lease { backend: Sqlite, pooled: true, released: false }"
        );
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::AcquireTimeout {
                max_size: 1,
                timeout_ms: 50
            }
        ));
    }

    #[tokio::test]
    async fn test_close_fails_pending_acquirers() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::open(&sqlite_db(&dir), PoolConfig::new(1)).unwrap();

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::PoolClosed)));

        // The in-flight lease is torn down when it comes back
        drop(held);
        let status = pool.status();
        assert_eq!(status.size, 0);
        assert_eq!(status.idle, 0);
        assert!(status.closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::open(&sqlite_db(&dir), PoolConfig::new(2)).unwrap();
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.status().idle, 1);

        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.status().size, 0);
        assert!(matches!(pool.acquire().await, Err(PoolError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_failed_connect_frees_the_slot() {
        let dir = TempDir::new().unwrap();
        let missing = format!("sqlite://{}", dir.path().join("missing.db").display());
        let pool = ConnectionPool::open(&missing, PoolConfig::new(1)).unwrap();

        assert!(matches!(pool.acquire().await, Err(PoolError::Connection(_))));
        assert!(matches!(pool.acquire().await, Err(PoolError::Connection(_))));
        let status = pool.status();
        assert_eq!(status.size, 0);
        assert_eq!(status.leased, 0);
    }

    #[tokio::test]
    async fn test_scope_closes_on_error() {
        let dir = TempDir::new().unwrap();
        let conn = sqlite_db(&dir);
        let mut seen = None;

        let result: Result<()> = ConnectionPool::scope(&conn, PoolConfig::new(2), |pool| {
            seen = Some(pool.clone());
            async move {
                assert!(!pool.is_closed());
                Err(PoolError::InvalidArgument("boom".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert!(seen.unwrap().is_closed());
    }

    #[test]
    fn test_scoped_guard_closes_on_drop() {
        let pool = ConnectionPool::open("sqlite:///tmp/x.db", PoolConfig::new(1)).unwrap();
        {
            let scoped = pool.clone().scoped();
            assert!(!scoped.is_closed());
        }
        assert!(pool.is_closed());
    }
}
