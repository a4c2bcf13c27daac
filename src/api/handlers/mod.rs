pub mod pool;
pub mod query;

use std::sync::Arc;

use crate::config::Config;
use crate::services::ConnectionPoolManager;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool_manager: Arc<ConnectionPoolManager>,
}
