use axum::{extract::State, Json};

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::ClosePoolRequest;
use crate::services::database::mask_credentials;

/// List all managed pools
pub async fn list_pools(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let pools = state.pool_manager.statuses().await;

    Ok(Json(serde_json::json!({
        "pools": pools,
        "count": pools.len(),
    })))
}

/// Close a pool and stop managing it
pub async fn close_pool(
    State(state): State<AppState>,
    Json(payload): Json<ClosePoolRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let masked = mask_credentials(&payload.connection_url);
    if !state.pool_manager.remove_pool(&payload.connection_url).await {
        return Err(AppError::NotFound(format!("No pool for {}", masked)));
    }

    Ok(Json(serde_json::json!({
        "closed": masked,
    })))
}
