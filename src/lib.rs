pub mod autoscaler;
pub mod config;
mod coordinator;
pub mod error;
pub mod messaging;
pub mod models;
pub mod pool;
pub mod registry;
pub mod routes;
pub mod worker;
pub mod worker_processing;
pub mod worker_scheduler;
pub mod workers;

pub use config::{Config, PoolConfig};
pub use error::{PoolError, SubmitError, TaskError};
pub use models::{TaskOptions, TaskPriority, TaskStatus, TaskType, WorkerStatus};
pub use pool::{TaskHandle, WorkerPool};
pub use worker_processing::{HandlerTable, TaskContext, TaskHandler};
