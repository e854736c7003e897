mod assert;
pub mod pool;
mod repeater;

pub use pool::{PoolError, TimerId, WorkKind, WorkerPool};
pub use repeater::Repeater;
