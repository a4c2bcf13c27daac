pub mod partition;
pub mod query;
pub mod table;

pub use partition::*;
pub use query::*;
pub use table::*;
