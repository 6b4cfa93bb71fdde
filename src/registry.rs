//! In-flight task table and the task state machine.
//!
//! A task is registered from submission until its caller-visible outcome is
//! delivered, then removed. The outcome channel is consumed on delivery, so a
//! caller hears about its task exactly once.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::error::TaskError;
use crate::messaging::WorkerId;
use crate::models::{CancelOutcome, TaskPriority, TaskSnapshot, TaskStatus, TaskType};
use crate::worker_scheduler::QueuedTask;

pub type TaskOutcome = Result<Value, TaskError>;

#[derive(Debug)]
pub struct Task {
  pub id: Uuid,
  pub task_type: TaskType,
  pub priority: TaskPriority,
  pub payload: Value,
  pub status: TaskStatus,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub worker_id: Option<WorkerId>,
  pub result: Option<Value>,
  pub error: Option<String>,
  pub retries: u32,
  pub max_retries: u32,
  pub timeout: Duration,
  pub retry_delay: Duration,
  attempt: u32,
  callback: Option<oneshot::Sender<TaskOutcome>>,
  /// Armed timeout while running, pending retry while retrying.
  timer: Option<JoinHandle<()>>,
}

/// Resolved submission parameters.
#[derive(Debug, Clone)]
pub struct TaskSpec {
  pub task_type: TaskType,
  pub payload: Value,
  pub priority: TaskPriority,
  pub timeout: Duration,
  pub max_retries: u32,
  pub retry_delay: Duration,
}

impl Task {
  pub fn new(spec: TaskSpec, callback: oneshot::Sender<TaskOutcome>) -> Self {
    Self {
      id: Uuid::new_v4(),
      task_type: spec.task_type,
      priority: spec.priority,
      payload: spec.payload,
      status: TaskStatus::Queued,
      created_at: Utc::now(),
      started_at: None,
      completed_at: None,
      worker_id: None,
      result: None,
      error: None,
      retries: 0,
      max_retries: spec.max_retries,
      timeout: spec.timeout,
      retry_delay: spec.retry_delay,
      attempt: 0,
      callback: Some(callback),
      timer: None,
    }
  }

  pub fn queued(&self) -> QueuedTask {
    QueuedTask { id: self.id, priority: self.priority, task_type: self.task_type }
  }

  pub fn snapshot(&self) -> TaskSnapshot {
    TaskSnapshot {
      id: self.id,
      task_type: self.task_type,
      priority: self.priority,
      status: self.status,
      created_at: self.created_at,
      started_at: self.started_at,
      completed_at: self.completed_at,
      worker_id: self.worker_id,
      retries: self.retries,
      max_retries: self.max_retries,
      error: self.error.clone(),
    }
  }

  fn clear_timer(&mut self) {
    if let Some(timer) = self.timer.take() {
      timer.abort();
    }
  }

  fn resolve(&mut self, outcome: TaskOutcome) {
    self.clear_timer();
    match self.callback.take() {
      Some(callback) => {
        if callback.send(outcome).is_err() {
          debug!(task_id = %self.id, "Caller dropped task handle before the outcome");
        }
      }
      None => debug!(task_id = %self.id, "Task outcome already delivered"),
    }
  }
}

/// Why an attempt failed.
#[derive(Debug, Clone)]
pub enum FailureCause {
  Handler(String),
  WorkerCrash { worker_id: WorkerId, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
  Retry { delay: Duration },
  Exhausted,
}

/// Returned when a task starts running, so the caller can arm its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningAttempt {
  pub attempt: u32,
  pub timeout: Duration,
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
  tasks: HashMap<Uuid, Task>,
}

impl TaskRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, task: Task) {
    self.tasks.insert(task.id, task);
  }

  pub fn get(&self, id: Uuid) -> Option<&Task> {
    self.tasks.get(&id)
  }

  pub fn contains(&self, id: Uuid) -> bool {
    self.tasks.contains_key(&id)
  }

  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }

  pub fn snapshots(&self) -> Vec<TaskSnapshot> {
    let mut snapshots: Vec<TaskSnapshot> = self.tasks.values().map(Task::snapshot).collect();
    snapshots.sort_by_key(|s| s.created_at);
    snapshots
  }

  pub fn counts_by_type(&self) -> BTreeMap<TaskType, usize> {
    let mut counts = BTreeMap::new();
    for task in self.tasks.values() {
      *counts.entry(task.task_type).or_insert(0) += 1;
    }
    counts
  }

  pub fn counts_by_status(&self) -> BTreeMap<TaskStatus, usize> {
    let mut counts = BTreeMap::new();
    for task in self.tasks.values() {
      *counts.entry(task.status).or_insert(0) += 1;
    }
    counts
  }

  /// Records which worker the task was handed to.
  pub fn mark_dispatched(&mut self, id: Uuid, worker_id: WorkerId) -> bool {
    match self.tasks.get_mut(&id) {
      Some(task) => {
        task.worker_id = Some(worker_id);
        true
      }
      None => false,
    }
  }

  /// QUEUED -> RUNNING on the worker's busy acknowledgment.
  pub fn start_attempt(&mut self, id: Uuid, worker_id: WorkerId) -> Option<RunningAttempt> {
    let task = self.tasks.get_mut(&id)?;
    if task.status != TaskStatus::Queued {
      return None;
    }
    task.status = TaskStatus::Running;
    task.started_at = Some(Utc::now());
    task.worker_id = Some(worker_id);
    task.attempt += 1;
    Some(RunningAttempt { attempt: task.attempt, timeout: task.timeout })
  }

  /// Stores the timer for the task's current state, replacing any previous one.
  pub fn set_timer(&mut self, id: Uuid, timer: JoinHandle<()>) {
    match self.tasks.get_mut(&id) {
      Some(task) => {
        task.clear_timer();
        task.timer = Some(timer);
      }
      None => timer.abort(),
    }
  }

  pub fn complete(&mut self, id: Uuid, value: Value) -> bool {
    if self.tasks.get(&id).is_none_or(|t| t.status == TaskStatus::Retrying) {
      return false;
    }
    let Some(mut task) = self.tasks.remove(&id) else {
      return false;
    };
    task.status = TaskStatus::Completed;
    task.completed_at = Some(Utc::now());
    task.result = Some(value.clone());
    task.resolve(Ok(value));
    true
  }

  /// Failure path shared by handler errors and worker crashes. Returns
  /// `None` when the task is no longer registered.
  pub fn fail(&mut self, id: Uuid, cause: FailureCause) -> Option<FailureOutcome> {
    let task = self.tasks.get_mut(&id)?;
    if task.status == TaskStatus::Retrying {
      return None;
    }
    task.clear_timer();
    task.completed_at = Some(Utc::now());
    let attempts = task.retries + 1;
    let error = match cause {
      FailureCause::Handler(detail) => TaskError::Failed { detail, attempts },
      FailureCause::WorkerCrash { worker_id, detail } => TaskError::WorkerCrashed { worker_id, detail },
    };
    task.error = Some(error.to_string());

    if task.retries < task.max_retries {
      task.retries += 1;
      task.status = TaskStatus::Retrying;
      return Some(FailureOutcome::Retry { delay: task.retry_delay });
    }

    let mut task = self.tasks.remove(&id)?;
    task.status = TaskStatus::Failed;
    task.resolve(Err(error));
    Some(FailureOutcome::Exhausted)
  }

  /// RETRYING -> QUEUED. Keeps id and retry counter, clears the attempt.
  pub fn reset_for_retry(&mut self, id: Uuid) -> Option<QueuedTask> {
    let task = self.tasks.get_mut(&id)?;
    if task.status != TaskStatus::Retrying {
      return None;
    }
    task.timer = None;
    task.status = TaskStatus::Queued;
    task.started_at = None;
    task.completed_at = None;
    task.worker_id = None;
    task.result = None;
    task.error = None;
    Some(task.queued())
  }

  /// Force-fails a task still running the given attempt. Returns the worker
  /// that was running it.
  pub fn time_out(&mut self, id: Uuid, attempt: u32) -> Option<Option<WorkerId>> {
    let task = self.tasks.get(&id)?;
    if task.status != TaskStatus::Running || task.attempt != attempt {
      return None;
    }
    let mut task = self.tasks.remove(&id)?;
    task.timer = None;
    task.status = TaskStatus::Timeout;
    task.completed_at = Some(Utc::now());
    let error = TaskError::Timeout(task.timeout);
    task.error = Some(error.to_string());
    task.resolve(Err(error));
    Some(task.worker_id)
  }

  pub fn cancel(&mut self, id: Uuid) -> CancelOutcome {
    let Some(task) = self.tasks.get(&id) else {
      return CancelOutcome::NotFound;
    };
    if task.status.is_terminal() {
      return CancelOutcome::AlreadyTerminal;
    }
    if let Some(mut task) = self.tasks.remove(&id) {
      task.status = TaskStatus::Cancelled;
      task.completed_at = Some(Utc::now());
      task.resolve(Err(TaskError::Cancelled));
    }
    CancelOutcome::Cancelled
  }

  /// Resolves every registered task with `error` and empties the table.
  pub fn drain_with(&mut self, error: TaskError) -> usize {
    let count = self.tasks.len();
    for (_, mut task) in self.tasks.drain() {
      task.resolve(Err(error.clone()));
    }
    count
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn spec(max_retries: u32) -> TaskSpec {
    TaskSpec {
      task_type: TaskType::TransactionVerification,
      payload: json!({ "tx": "0xabc" }),
      priority: TaskPriority::Normal,
      timeout: Duration::from_secs(1),
      max_retries,
      retry_delay: Duration::from_millis(10),
    }
  }

  fn register(registry: &mut TaskRegistry, max_retries: u32) -> (Uuid, oneshot::Receiver<TaskOutcome>) {
    let (tx, rx) = oneshot::channel();
    let task = Task::new(spec(max_retries), tx);
    let id = task.id;
    registry.insert(task);
    (id, rx)
  }

  #[test]
  fn completion_resolves_and_deregisters() {
    let mut registry = TaskRegistry::new();
    let (id, mut rx) = register(&mut registry, 0);
    registry.start_attempt(id, 1).unwrap();

    assert!(registry.complete(id, json!(42)));
    assert!(!registry.contains(id));
    assert_eq!(rx.try_recv().unwrap(), Ok(json!(42)));
    assert!(!registry.complete(id, json!(43)), "duplicate result is ignored");
  }

  #[test]
  fn retries_until_exhausted() {
    let mut registry = TaskRegistry::new();
    let (id, mut rx) = register(&mut registry, 2);

    let mut attempts = 0;
    loop {
      registry.start_attempt(id, 1).unwrap();
      attempts += 1;
      match registry.fail(id, FailureCause::Handler("bad signature".into())).unwrap() {
        FailureOutcome::Retry { delay } => {
          assert_eq!(delay, Duration::from_millis(10));
          let queued = registry.reset_for_retry(id).unwrap();
          assert_eq!(queued.id, id);
          assert_eq!(registry.get(id).unwrap().status, TaskStatus::Queued);
        }
        FailureOutcome::Exhausted => break,
      }
    }

    assert_eq!(attempts, 3);
    assert!(registry.is_empty());
    assert_eq!(
      rx.try_recv().unwrap(),
      Err(TaskError::Failed { detail: "bad signature".into(), attempts: 3 })
    );
  }

  #[test]
  fn stale_timeout_is_ignored() {
    let mut registry = TaskRegistry::new();
    let (id, _rx) = register(&mut registry, 1);
    let first = registry.start_attempt(id, 1).unwrap();
    registry.fail(id, FailureCause::Handler("flaky rpc".into()));
    registry.reset_for_retry(id);
    let second = registry.start_attempt(id, 2).unwrap();

    assert!(registry.time_out(id, first.attempt).is_none());
    assert_eq!(registry.time_out(id, second.attempt), Some(Some(2)));
    assert!(registry.is_empty());
  }

  #[test]
  fn cancel_reports_unknown_tasks() {
    let mut registry = TaskRegistry::new();
    let (id, mut rx) = register(&mut registry, 3);

    assert_eq!(registry.cancel(id), CancelOutcome::Cancelled);
    assert_eq!(registry.cancel(id), CancelOutcome::NotFound);
    assert_eq!(rx.try_recv().unwrap(), Err(TaskError::Cancelled));
  }

  #[test]
  fn drain_resolves_everything_once() {
    let mut registry = TaskRegistry::new();
    let (_, mut a) = register(&mut registry, 0);
    let (_, mut b) = register(&mut registry, 0);

    assert_eq!(registry.drain_with(TaskError::Shutdown), 2);
    assert_eq!(a.try_recv().unwrap(), Err(TaskError::Shutdown));
    assert_eq!(b.try_recv().unwrap(), Err(TaskError::Shutdown));
    assert!(registry.is_empty());
  }
}
