// SQLite connection; rusqlite calls run on the blocking thread pool
use rusqlite::types::ValueRef;
use rusqlite::{Connection as RusqliteConnection, OpenFlags};

use super::adapter::SourceConnection;
use super::batch::{BatchBuilder, CellValue, ColumnBatches, LogicalType};
use super::{Backend, Protocol};
use crate::error::{PoolError, Result};

pub struct SqliteConnection {
    conn: Option<RusqliteConnection>,
}

impl SqliteConnection {
    /// Open `path` read-only.
    pub async fn open(path: &str) -> Result<Self> {
        let owned = path.to_string();
        let conn = tokio::task::spawn_blocking(move || {
            RusqliteConnection::open_with_flags(
                &owned,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        })
        .await
        .map_err(|e| PoolError::Connection(format!("blocking task failed: {}", e)))?
        .map_err(|e| PoolError::Connection(format!("Failed to open SQLite database {}: {}", path, e)))?;

        Ok(Self { conn: Some(conn) })
    }

    /// Run `f` against the connection on a blocking thread and hand the connection back.
    async fn with_connection<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RusqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| PoolError::Connection("SQLite connection is gone".to_string()))?;
        let join = tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let result = f(&mut conn);
            (conn, result)
        })
        .await;

        match join {
            Ok((conn, result)) => {
                self.conn = Some(conn);
                result
            }
            Err(e) => Err(PoolError::Connection(format!("blocking task failed: {}", e))),
        }
    }
}

#[async_trait::async_trait]
impl SourceConnection for SqliteConnection {
    async fn execute(
        &mut self,
        sql: &str,
        protocol: Protocol,
        batch_size: usize,
    ) -> Result<ColumnBatches> {
        if protocol != Protocol::Binary {
            return Err(PoolError::InvalidArgument(format!(
                "SQLite does not support the {} protocol",
                protocol
            )));
        }
        let sql = sql.to_string();
        self.with_connection(move |conn| query_batches(conn, &sql, batch_size))
            .await
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.with_connection(move |conn| conn.execute_batch(&sql).map_err(sqlite_error))
            .await
    }

    async fn ping(&mut self) -> bool {
        self.with_connection(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(sqlite_error)
        })
        .await
        .is_ok()
    }

    fn is_broken(&self) -> bool {
        self.conn.is_none()
    }

    fn backend(&self) -> Backend {
        Backend::Sqlite
    }
}

fn sqlite_error(e: rusqlite::Error) -> PoolError {
    PoolError::execution(format!("Query execution failed: {}", e))
}

fn query_batches(conn: &RusqliteConnection, sql: &str, batch_size: usize) -> Result<ColumnBatches> {
    let mut stmt = conn.prepare(sql).map_err(sqlite_error)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let declared: Vec<Option<LogicalType>> = stmt
        .columns()
        .iter()
        .map(|c| c.decl_type().and_then(declared_type))
        .collect();
    let column_count = names.len();
    let mut builder = BatchBuilder::new(names, declared, batch_size);

    let mut rows = stmt.query([]).map_err(sqlite_error)?;
    while let Some(row) = rows.next().map_err(sqlite_error)? {
        let cells = (0..column_count)
            .map(|idx| row.get_ref(idx).map(to_cell))
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite_error)?;
        builder.push_row(cells)?;
    }

    builder.finish()
}

/// Column affinity from the declared type name, following SQLite's own rules.
/// `None` leaves the type to be inferred from the stored values.
fn declared_type(decl: &str) -> Option<LogicalType> {
    let decl = decl.to_uppercase();
    if decl.contains("DATETIME") || decl.contains("TIMESTAMP") {
        Some(LogicalType::Timestamp)
    } else if decl.contains("DATE") {
        Some(LogicalType::Date)
    } else if decl.contains("BOOL") {
        Some(LogicalType::Boolean)
    } else if decl.contains("INT") {
        Some(LogicalType::Int64)
    } else if decl.contains("CHAR") || decl.contains("CLOB") || decl.contains("TEXT") {
        Some(LogicalType::Text)
    } else if decl.contains("BLOB") {
        Some(LogicalType::Binary)
    } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
        Some(LogicalType::Float64)
    } else {
        None
    }
}

fn to_cell(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) => CellValue::Int(i),
        ValueRef::Real(f) => CellValue::Float(f),
        ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => CellValue::Bytes(b.to_vec()),
    }
}
