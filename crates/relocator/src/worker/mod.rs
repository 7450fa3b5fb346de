pub mod pool;
pub mod registry;
pub mod stats;
pub mod task;

pub use pool::WorkerPool;
pub use registry::{TaskFn, TaskRegistry};
pub use stats::{PoolStats, WorkerInfo};
pub use task::{TaskHandle, TaskId, TaskOutcome, WorkerId};
