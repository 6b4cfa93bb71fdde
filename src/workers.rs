use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::messaging::{WorkerCommand, WorkerId};
use crate::models::{TaskType, WorkerMetrics, WorkerSnapshot, WorkerStatus};
use crate::worker::WorkerHandle;

/// Coordinator-side view of one worker runtime.
#[derive(Debug)]
pub struct WorkerRecord {
  pub id: WorkerId,
  handle: WorkerHandle,
  pub status: WorkerStatus,
  /// Set iff the worker is BUSY.
  pub current_task: Option<Uuid>,
  pub created_at: DateTime<Utc>,
  pub last_activity: DateTime<Utc>,
  pub tasks_processed: u64,
  pub tasks_failed: u64,
  pub affinity: Option<HashSet<TaskType>>,
  pub cpu_usage: Option<f64>,
  pub memory_usage: Option<u64>,
  pub stop_waiters: Vec<oneshot::Sender<()>>,
  pub stop_timer: Option<JoinHandle<()>>,
  /// Start a fresh worker once this one is gone.
  pub replace_on_exit: bool,
}

impl WorkerRecord {
  pub fn new(id: WorkerId, handle: WorkerHandle) -> Self {
    let now = Utc::now();
    Self {
      id,
      handle,
      status: WorkerStatus::Starting,
      current_task: None,
      created_at: now,
      last_activity: now,
      tasks_processed: 0,
      tasks_failed: 0,
      affinity: None,
      cpu_usage: None,
      memory_usage: None,
      stop_waiters: Vec::new(),
      stop_timer: None,
      replace_on_exit: false,
    }
  }

  pub fn send(&self, command: WorkerCommand) -> bool {
    self.handle.send(command)
  }

  /// Forcibly ends the runtime and wakes anyone waiting on its stop.
  pub fn dispose(mut self) {
    if let Some(timer) = self.stop_timer.take() {
      timer.abort();
    }
    self.handle.abort();
    for waiter in self.stop_waiters.drain(..) {
      let _ = waiter.send(());
    }
  }

  pub fn touch(&mut self) {
    self.last_activity = Utc::now();
  }

  pub fn set_busy(&mut self, task_id: Uuid) {
    self.status = WorkerStatus::Busy;
    self.current_task = Some(task_id);
    self.touch();
  }

  pub fn set_idle(&mut self) {
    self.status = WorkerStatus::Idle;
    self.current_task = None;
    self.touch();
  }

  pub fn record_metrics(&mut self, metrics: &WorkerMetrics) {
    self.cpu_usage = Some(metrics.cpu);
    self.memory_usage = Some(metrics.memory);
  }

  pub fn is_live(&self) -> bool {
    !matches!(self.status, WorkerStatus::Stopping | WorkerStatus::Crashed)
  }

  pub fn snapshot(&self) -> WorkerSnapshot {
    WorkerSnapshot {
      id: self.id,
      status: self.status,
      current_task_id: self.current_task,
      created_at: self.created_at,
      last_activity: self.last_activity,
      tasks_processed: self.tasks_processed,
      tasks_failed: self.tasks_failed,
      affinity: self.affinity.as_ref().map(sorted_types),
      cpu_usage: self.cpu_usage,
      memory_usage: self.memory_usage,
    }
  }
}

pub fn sorted_types(types: &HashSet<TaskType>) -> Vec<TaskType> {
  let mut types: Vec<TaskType> = types.iter().copied().collect();
  types.sort();
  types
}

/// All worker records, keyed by an id that is never reused.
#[derive(Debug)]
pub struct WorkerTable {
  next_id: WorkerId,
  workers: BTreeMap<WorkerId, WorkerRecord>,
}

impl WorkerTable {
  pub fn new() -> Self {
    Self { next_id: 1, workers: BTreeMap::new() }
  }

  pub fn allocate_id(&mut self) -> WorkerId {
    let id = self.next_id;
    self.next_id += 1;
    id
  }

  pub fn insert(&mut self, record: WorkerRecord) {
    self.workers.insert(record.id, record);
  }

  pub fn get(&self, id: WorkerId) -> Option<&WorkerRecord> {
    self.workers.get(&id)
  }

  pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerRecord> {
    self.workers.get_mut(&id)
  }

  pub fn remove(&mut self, id: WorkerId) -> Option<WorkerRecord> {
    self.workers.remove(&id)
  }

  pub fn ids(&self) -> Vec<WorkerId> {
    self.workers.keys().copied().collect()
  }

  pub fn idle_ids(&self) -> Vec<WorkerId> {
    self.with_status(WorkerStatus::Idle)
  }

  pub fn with_status(&self, status: WorkerStatus) -> Vec<WorkerId> {
    self.workers.values().filter(|w| w.status == status).map(|w| w.id).collect()
  }

  pub fn live(&self) -> impl Iterator<Item = &WorkerRecord> {
    self.workers.values().filter(|w| w.is_live())
  }

  pub fn live_count(&self) -> usize {
    self.live().count()
  }

  pub fn len(&self) -> usize {
    self.workers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.workers.is_empty()
  }

  pub fn count(&self, status: WorkerStatus) -> usize {
    self.workers.values().filter(|w| w.status == status).count()
  }

  pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
    self.workers.values().map(WorkerRecord::snapshot).collect()
  }
}

impl Default for WorkerTable {
  fn default() -> Self {
    Self::new()
  }
}
