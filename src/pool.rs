use std::collections::HashSet;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::coordinator::{Command, Coordinator, Message};
use crate::error::{PoolError, SubmitError, TaskError};
use crate::messaging::WorkerId;
use crate::models::{
  CancelOutcome, PoolStats, TaskOptions, TaskSnapshot, TaskType, WorkerSnapshot,
};
use crate::registry::TaskOutcome;
use crate::worker_processing::HandlerTable;

/// Cloneable handle to a worker pool. Every call is a message to the pool's
/// coordinator; none of them wait on a worker except the task outcome.
#[derive(Clone, Debug)]
pub struct WorkerPool {
  inbox: mpsc::UnboundedSender<Message>,
}

/// Pending outcome of one accepted submission. Resolves exactly once.
#[derive(Debug)]
pub struct TaskHandle {
  id: Uuid,
  outcome: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
  pub fn id(&self) -> Uuid {
    self.id
  }

  pub async fn outcome(self) -> Result<Value, TaskError> {
    self.outcome.await.unwrap_or(Err(TaskError::Unavailable))
  }
}

impl WorkerPool {
  /// Creates an idle pool. Must be called inside a tokio runtime.
  pub fn new(config: PoolConfig, handlers: HandlerTable) -> Self {
    Self { inbox: Coordinator::spawn(config, handlers) }
  }

  /// Starts the configured minimum of workers and the autoscaler.
  pub async fn start(&self) -> Result<(), PoolError> {
    self.request(|reply| Command::Start { reply }).await
  }

  /// Stops the autoscaler and every worker, resolving outstanding
  /// submissions with [`TaskError::Shutdown`]. Returns once all workers exited.
  pub async fn stop(&self) -> Result<(), PoolError> {
    self.request(|reply| Command::Stop { reply }).await
  }

  pub async fn submit(
    &self,
    task_type: TaskType,
    payload: Value,
    options: TaskOptions,
  ) -> Result<TaskHandle, SubmitError> {
    let (id, outcome) = self
      .request(|reply| Command::Submit { task_type, payload, options, reply })
      .await
      .map_err(|_| SubmitError::Unavailable)??;
    Ok(TaskHandle { id, outcome })
  }

  /// Submits and waits for the task's outcome.
  pub async fn submit_task(
    &self,
    task_type: TaskType,
    payload: Value,
    options: TaskOptions,
  ) -> Result<Value, TaskError> {
    self.submit(task_type, payload, options).await?.outcome().await
  }

  pub async fn cancel(&self, task_id: Uuid) -> Result<CancelOutcome, PoolError> {
    self.request(|reply| Command::Cancel { task_id, reply }).await
  }

  pub async fn cancel_task(&self, task_id: Uuid) -> bool {
    matches!(self.cancel(task_id).await, Ok(CancelOutcome::Cancelled))
  }

  pub async fn get_task_status(&self, task_id: Uuid) -> Result<Option<TaskSnapshot>, PoolError> {
    self.request(|reply| Command::TaskStatus { task_id, reply }).await
  }

  pub async fn get_all_task_statuses(&self) -> Result<Vec<TaskSnapshot>, PoolError> {
    self.request(|reply| Command::AllTaskStatuses { reply }).await
  }

  pub async fn get_all_worker_statuses(&self) -> Result<Vec<WorkerSnapshot>, PoolError> {
    self.request(|reply| Command::AllWorkerStatuses { reply }).await
  }

  /// Worker, queue and task counters.
  pub async fn stats(&self) -> Result<PoolStats, PoolError> {
    self.request(|reply| Command::Stats { reply }).await
  }

  pub async fn set_worker_affinity(
    &self,
    worker_id: WorkerId,
    task_types: impl IntoIterator<Item = TaskType>,
  ) -> Result<bool, PoolError> {
    let task_types: HashSet<TaskType> = task_types.into_iter().collect();
    self.request(|reply| Command::SetAffinity { worker_id, task_types, reply }).await
  }

  pub async fn get_worker_affinity(&self, worker_id: WorkerId) -> Result<Option<Vec<TaskType>>, PoolError> {
    self.request(|reply| Command::GetAffinity { worker_id, reply }).await
  }

  pub async fn clear_worker_affinity(&self, worker_id: WorkerId) -> Result<bool, PoolError> {
    self.request(|reply| Command::ClearAffinity { worker_id, reply }).await
  }

  /// Asks one worker to report metrics. The answer lands in its status later.
  pub async fn request_worker_metrics(&self, worker_id: WorkerId) -> Result<bool, PoolError> {
    let asked = self
      .request(|reply| Command::RequestMetrics { worker_id: Some(worker_id), reply })
      .await?;
    Ok(asked > 0)
  }

  /// Asks every live worker to report metrics; returns how many were asked.
  pub async fn request_all_worker_metrics(&self) -> Result<usize, PoolError> {
    self.request(|reply| Command::RequestMetrics { worker_id: None, reply }).await
  }

  async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, PoolError> {
    let (reply, rx) = oneshot::channel();
    self
      .inbox
      .send(Message::Command(build(reply)))
      .map_err(|_| PoolError::Unavailable)?;
    rx.await.map_err(|_| PoolError::Unavailable)
  }
}
