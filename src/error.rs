use std::time::Duration;

use thiserror::Error;

/// Why a submission was refused. No task exists when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
  #[error("worker pool is not running")]
  NotRunning,
  #[error("task queue is full ({capacity} tasks)")]
  QueueFull { capacity: usize },
  #[error("worker pool coordinator is unavailable")]
  Unavailable,
}

/// Outcome delivered to a caller whose task did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
  #[error("task failed after {attempts} attempt(s): {detail}")]
  Failed { detail: String, attempts: u32 },
  #[error("worker {worker_id} crashed while running the task: {detail}")]
  WorkerCrashed { worker_id: u64, detail: String },
  #[error("task timed out after {0:?}")]
  Timeout(Duration),
  #[error("task was cancelled")]
  Cancelled,
  #[error("worker pool shut down before the task finished")]
  Shutdown,
  #[error("task was rejected: {0}")]
  Rejected(#[from] SubmitError),
  #[error("worker pool coordinator is unavailable")]
  Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
  #[error("worker pool coordinator is unavailable")]
  Unavailable,
}
