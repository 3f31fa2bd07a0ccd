pub mod job;
pub mod queue;
pub mod registry;

pub use job::{Job, JobStatus, Priority};
pub use queue::{function_key, JobScheduler};
pub use registry::{Worker, WorkerRegistry};
