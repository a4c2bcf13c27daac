use thiserror::Error;

/// Errors raised by the pool, the planner, the dispatcher and the merger.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Timed out waiting for a pooled connection (max_size={max_size}, timeout_ms={timeout_ms})")]
    AcquireTimeout { max_size: usize, timeout_ms: u128 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("{}", execution_message(.partition, .predicate, .message))]
    Execution {
        /// `None` for statements that belong to no partition, such as range inference.
        partition: Option<usize>,
        predicate: Option<String>,
        message: String,
    },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Row count mismatch: expected {expected} rows, merged {actual}")]
    RowCountMismatch { expected: usize, actual: usize },
}

fn execution_message(
    partition: &Option<usize>,
    predicate: &Option<String>,
    message: &str,
) -> String {
    match (partition, predicate) {
        (Some(partition), Some(predicate)) => format!(
            "Execution error in partition {} ({}): {}",
            partition, predicate, message
        ),
        (Some(partition), None) => {
            format!("Execution error in partition {}: {}", partition, message)
        }
        (None, _) => format!("Execution error: {}", message),
    }
}

impl PoolError {
    /// Shorthand for a backend failure outside of any partition context.
    pub fn execution(message: impl Into<String>) -> Self {
        PoolError::Execution {
            partition: None,
            predicate: None,
            message: message.into(),
        }
    }

    /// Attach partition context to a backend failure.
    ///
    /// Errors that already describe a non-backend problem (closed pool, timeout, ...)
    /// are returned unchanged so the caller still sees the specific variant.
    pub fn in_partition(self, partition: usize, predicate: Option<&str>) -> Self {
        match self {
            PoolError::Execution { message, .. } => PoolError::Execution {
                partition: Some(partition),
                predicate: predicate.map(str::to_string),
                message,
            },
            PoolError::Connection(message) => PoolError::Execution {
                partition: Some(partition),
                predicate: predicate.map(str::to_string),
                message,
            },
            other => other,
        }
    }
}

impl From<datafusion::arrow::error::ArrowError> for PoolError {
    fn from(err: datafusion::arrow::error::ArrowError) -> Self {
        PoolError::execution(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
