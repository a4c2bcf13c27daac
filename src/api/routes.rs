use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{pool, query, AppState};
use crate::config::Config;
use crate::services::ConnectionPoolManager;

/// Create router with application state
pub fn create_router_with_state(pool_manager: Arc<ConnectionPoolManager>, config: Config) -> Router {
    let state = AppState {
        config,
        pool_manager,
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/query", post(query::execute_query))
        .route("/api/pools", get(pool::list_pools).delete(pool::close_pool))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoggingConfig, PoolSettings, QuerySettings, ServerConfig};
    use crate::services::PoolConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            pool: PoolSettings {
                max_size: 4,
                idle_timeout_secs: 300,
                max_lifetime_secs: 1800,
                connection_timeout_secs: 5,
                test_on_check_out: true,
            },
            query: QuerySettings { batch_size: 1024 },
            logging: LoggingConfig {
                level: "info".to_string(),
                style: "auto".to_string(),
            },
        }
    }

    fn test_app() -> (Router, Arc<ConnectionPoolManager>) {
        let manager = Arc::new(ConnectionPoolManager::with_config(PoolConfig::new(4)));
        (create_router_with_state(manager.clone(), test_config()), manager)
    }

    fn sqlite_url(dir: &TempDir) -> String {
        let path = dir.path().join("api.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (a INTEGER NOT NULL, c TEXT);
             INSERT INTO t VALUES (0, 'x'), (1, 'y'), (2, 'z'), (3, 'w');",
        )
        .unwrap();
        format!("sqlite://{}", path.display())
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
    }

    #[tokio::test]
    async fn test_partitioned_query() {
        let dir = TempDir::new().unwrap();
        let url = sqlite_url(&dir);
        let (app, manager) = test_app();

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/query",
                json!({
                    "connection_url": url,
                    "query": "SELECT a, c FROM t",
                    "partition_on": "a",
                    "partition_num": 2,
                    "order_by_partition": true
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["columns"], json!(["a", "c"]));
        assert_eq!(body["row_count"], json!(4));
        assert_eq!(body["partitions"], json!(2));
        assert_eq!(body["rows"][0], json!([0, "x"]));
        assert_eq!(body["rows"][3], json!([3, "w"]));
        assert_eq!(manager.pool_count().await, 1);
    }

    #[tokio::test]
    async fn test_partitions_reports_the_planned_count() {
        let dir = TempDir::new().unwrap();
        let (app, _) = test_app();

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/query",
                json!({
                    "connection_url": sqlite_url(&dir),
                    "query": "SELECT a FROM t",
                    "partition_on": "a",
                    "partition_range": [2, 3],
                    "partition_num": 4
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["row_count"], json!(2));
        assert_eq!(body["partitions"], json!(2));
    }

    #[tokio::test]
    async fn test_non_select_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (app, _) = test_app();

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/query",
                json!({ "connection_url": sqlite_url(&dir), "query": "DELETE FROM t" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], json!("INVALID_SQL"));
    }

    #[tokio::test]
    async fn test_partition_num_above_max_size() {
        let dir = TempDir::new().unwrap();
        let (app, _) = test_app();

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/query",
                json!({
                    "connection_url": sqlite_url(&dir),
                    "query": "SELECT a FROM t",
                    "partition_on": "a",
                    "partition_num": 9
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("partition_num"));
    }

    #[tokio::test]
    async fn test_list_and_close_pools() {
        let dir = TempDir::new().unwrap();
        let url = sqlite_url(&dir);
        let (app, manager) = test_app();
        manager.get_or_create_pool(&url).await.unwrap();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/pools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["count"], json!(1));
        assert_eq!(body["pools"][0]["backend"], json!("sqlite"));
        assert_eq!(body["pools"][0]["max_size"], json!(4));

        let response = app
            .clone()
            .oneshot(json_request("DELETE", "/api/pools", json!({ "connection_url": url })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(manager.pool_count().await, 0);

        let response = app
            .oneshot(json_request("DELETE", "/api/pools", json!({ "connection_url": url })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
