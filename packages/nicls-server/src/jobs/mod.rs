mod pool;
mod types;

pub use pool::{PoolRegistry, PoolStats, WorkerPool};
pub use types::{ClassificationJob, ClassificationResult, JobError, JobKind, JobOutput};
