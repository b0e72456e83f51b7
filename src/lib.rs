pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod macaroons;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod server;
pub mod telemetry;
pub mod worker;

pub use db::DistributedBatchQueue;
pub use error::{JobQueueError, Result};
pub use memory::MemoryBatchQueue;
pub use models::{JobQueueBatch, JobQueueBatchFile, JobRequest, JobResult, JobStatus, ResourceType};
pub use queue::{JobQueue, QueueConfig};
