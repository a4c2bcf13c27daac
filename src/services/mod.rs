pub mod connection_pool;
pub mod converter; // Arrow → rows / DataFrame
pub mod database; // Backend connections
pub mod dispatcher;
pub mod merger;
pub mod partition_planner;
pub mod pool_manager;
pub mod query_service;

pub use connection_pool::*;
pub use converter::*;
pub use dispatcher::*;
pub use merger::*;
pub use partition_planner::*;
pub use pool_manager::*;
pub use query_service::*;
