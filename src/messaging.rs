//! Message contract between the coordinator and its worker runtimes.

use serde_json::Value;
use uuid::Uuid;

use crate::models::{TaskType, WorkerMetrics};

pub type WorkerId = u64;

/// Coordinator to worker.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
  Task { task_id: Uuid, task_type: TaskType, payload: Value },
  Terminate,
  GetMetrics,
}

/// Worker to coordinator.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
  Ready,
  Busy { task_id: Uuid },
  Idle,
  Result { task_id: Uuid, value: Value },
  Error { task_id: Uuid, detail: String },
  FatalError { detail: String },
  Metrics(WorkerMetrics),
  /// Emitted by the exit watcher once the runtime task has ended.
  Exited { graceful: bool },
}

/// A worker event tagged with its origin.
#[derive(Debug, Clone)]
pub struct WorkerSignal {
  pub worker_id: WorkerId,
  pub event: WorkerEvent,
}
