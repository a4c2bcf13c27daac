use std::time::Instant;

use axum::{extract::State, Json};

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{QueryRequest, QueryResponse, ReadOptions, ReturnType};
use crate::services::database::{mask_credentials, Protocol};
use crate::services::read_sql;

/// Execute a (possibly partitioned) SQL query on a managed pool
pub async fn execute_query(
    State(state): State<AppState>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    tracing::info!(
        "Executing query on {}",
        mask_credentials(&payload.connection_url)
    );

    let sanitized_query = payload.query.trim();
    if sanitized_query.is_empty() {
        return Err(AppError::Validation("SQL query cannot be empty".to_string()));
    }

    let options = read_options(&payload)?;

    let start_time = Instant::now();
    let pool = state
        .pool_manager
        .get_or_create_pool(&payload.connection_url)
        .await?;
    let table = read_sql(pool, sanitized_query, options).await?;
    let execution_time_ms = start_time.elapsed().as_millis() as u64;

    let result = table
        .into_rows()
        .ok_or_else(|| AppError::Internal("query did not produce rows".to_string()))?;

    Ok(Json(QueryResponse {
        columns: result.columns,
        rows: result.rows,
        row_count: result.row_count,
        partitions: result.partitions,
        execution_time_ms,
    }))
}

fn read_options(payload: &QueryRequest) -> Result<ReadOptions, AppError> {
    let mut options = ReadOptions::new()
        .return_type(ReturnType::Rows)
        .order_by_partition(payload.order_by_partition);
    options.partition_on = payload.partition_on.clone();
    options.partition_range = payload.partition_range;
    options.partition_num = payload.partition_num;
    options.pre_execution_queries = payload.pre_execution_queries.clone();
    if let Some(protocol) = &payload.protocol {
        options.protocol = Some(protocol.parse::<Protocol>()?);
    }
    Ok(options)
}
