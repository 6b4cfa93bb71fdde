//! The coordinator owns every worker record, the task registry and the
//! queue. It runs as a single tokio task draining one channel, so all state
//! transitions are serialized.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::autoscaler::{self, LoadSnapshot, ScaleDecision, WorkerLoad};
use crate::config::PoolConfig;
use crate::error::{SubmitError, TaskError};
use crate::messaging::{WorkerCommand, WorkerEvent, WorkerId, WorkerSignal};
use crate::models::{
  CancelOutcome, PoolStats, TaskOptions, TaskSnapshot, TaskType, WorkerSnapshot, WorkerStatus,
};
use crate::registry::{FailureCause, FailureOutcome, Task, TaskOutcome, TaskRegistry, TaskSpec};
use crate::worker::spawn_worker;
use crate::worker_processing::HandlerTable;
use crate::worker_scheduler::{QueuedTask, TaskQueue};
use crate::workers::{WorkerRecord, WorkerTable, sorted_types};

pub(crate) type Submission = (Uuid, oneshot::Receiver<TaskOutcome>);

pub(crate) enum Message {
  Command(Command),
  Worker(WorkerSignal),
  Timer(Timer),
}

impl From<WorkerSignal> for Message {
  fn from(signal: WorkerSignal) -> Self {
    Message::Worker(signal)
  }
}

pub(crate) enum Command {
  Start { reply: oneshot::Sender<()> },
  Stop { reply: oneshot::Sender<()> },
  Submit {
    task_type: TaskType,
    payload: Value,
    options: TaskOptions,
    reply: oneshot::Sender<Result<Submission, SubmitError>>,
  },
  Cancel { task_id: Uuid, reply: oneshot::Sender<CancelOutcome> },
  TaskStatus { task_id: Uuid, reply: oneshot::Sender<Option<TaskSnapshot>> },
  AllTaskStatuses { reply: oneshot::Sender<Vec<TaskSnapshot>> },
  AllWorkerStatuses { reply: oneshot::Sender<Vec<WorkerSnapshot>> },
  Stats { reply: oneshot::Sender<PoolStats> },
  SetAffinity { worker_id: WorkerId, task_types: HashSet<TaskType>, reply: oneshot::Sender<bool> },
  GetAffinity { worker_id: WorkerId, reply: oneshot::Sender<Option<Vec<TaskType>>> },
  ClearAffinity { worker_id: WorkerId, reply: oneshot::Sender<bool> },
  RequestMetrics { worker_id: Option<WorkerId>, reply: oneshot::Sender<usize> },
}

pub(crate) enum Timer {
  TaskTimeout { task_id: Uuid, attempt: u32 },
  RetryDue { task_id: Uuid },
  StopDeadline { worker_id: WorkerId },
  AutoscaleTick,
}

pub(crate) struct Coordinator {
  config: PoolConfig,
  handlers: Arc<HandlerTable>,
  inbox: mpsc::WeakUnboundedSender<Message>,
  running: bool,
  workers: WorkerTable,
  registry: TaskRegistry,
  queue: TaskQueue,
  autoscale_timer: Option<JoinHandle<()>>,
}

impl Coordinator {
  /// Spawns the coordinator loop and returns its inbox.
  pub(crate) fn spawn(config: PoolConfig, handlers: HandlerTable) -> mpsc::UnboundedSender<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator {
      config,
      handlers: Arc::new(handlers),
      inbox: tx.downgrade(),
      running: false,
      workers: WorkerTable::new(),
      registry: TaskRegistry::new(),
      queue: TaskQueue::new(),
      autoscale_timer: None,
    };
    tokio::spawn(coordinator.run(rx));
    tx
  }

  async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
      match message {
        Message::Command(command) => self.handle_command(command),
        Message::Worker(signal) => self.handle_worker_event(signal),
        Message::Timer(timer) => self.handle_timer(timer),
      }
    }
    debug!("Coordinator inbox closed");
  }

  fn handle_command(&mut self, command: Command) {
    match command {
      Command::Start { reply } => {
        self.start();
        let _ = reply.send(());
      }
      Command::Stop { reply } => self.stop(reply),
      Command::Submit { task_type, payload, options, reply } => {
        let _ = reply.send(self.submit(task_type, payload, options));
      }
      Command::Cancel { task_id, reply } => {
        let _ = reply.send(self.cancel(task_id));
      }
      Command::TaskStatus { task_id, reply } => {
        let _ = reply.send(self.registry.get(task_id).map(Task::snapshot));
      }
      Command::AllTaskStatuses { reply } => {
        let _ = reply.send(self.registry.snapshots());
      }
      Command::AllWorkerStatuses { reply } => {
        let _ = reply.send(self.workers.snapshots());
      }
      Command::Stats { reply } => {
        let _ = reply.send(self.stats());
      }
      Command::SetAffinity { worker_id, task_types, reply } => {
        let found = match self.workers.get_mut(worker_id) {
          Some(record) => {
            info!(worker_id, affinity = ?sorted_types(&task_types), "Worker affinity set");
            record.affinity = Some(task_types);
            true
          }
          None => false,
        };
        let _ = reply.send(found);
      }
      Command::GetAffinity { worker_id, reply } => {
        let affinity = self
          .workers
          .get(worker_id)
          .and_then(|record| record.affinity.as_ref())
          .map(sorted_types);
        let _ = reply.send(affinity);
      }
      Command::ClearAffinity { worker_id, reply } => {
        let found = match self.workers.get_mut(worker_id) {
          Some(record) => {
            record.affinity = None;
            true
          }
          None => false,
        };
        let _ = reply.send(found);
      }
      Command::RequestMetrics { worker_id, reply } => {
        let asked = match worker_id {
          Some(id) => self
            .workers
            .get(id)
            .filter(|record| record.is_live())
            .map(|record| record.send(WorkerCommand::GetMetrics) as usize)
            .unwrap_or(0),
          None => self.request_all_metrics(),
        };
        let _ = reply.send(asked);
      }
    }
  }

  fn start(&mut self) {
    if self.running {
      return;
    }
    self.running = true;
    for _ in self.workers.live_count()..self.config.min_workers {
      self.start_worker();
    }
    if self.config.autoscaling_enabled {
      self.autoscale_timer = self.spawn_autoscale_loop();
    }
    info!(
      min_workers = self.config.min_workers,
      max_workers = self.config.max_workers,
      autoscaling = self.config.autoscaling_enabled,
      "Worker pool started"
    );
  }

  fn stop(&mut self, reply: oneshot::Sender<()>) {
    self.running = false;
    if let Some(timer) = self.autoscale_timer.take() {
      timer.abort();
    }
    self.queue.clear();
    let dropped = self.registry.drain_with(TaskError::Shutdown);

    let mut exits = Vec::new();
    for worker_id in self.workers.ids() {
      let (tx, rx) = oneshot::channel();
      self.stop_worker(worker_id, Some(tx));
      exits.push(rx);
    }
    info!(workers = exits.len(), dropped_tasks = dropped, "Worker pool stopping");

    tokio::spawn(async move {
      futures::future::join_all(exits).await;
      info!("Worker pool stopped");
      let _ = reply.send(());
    });
  }

  fn submit(
    &mut self,
    task_type: TaskType,
    payload: Value,
    options: TaskOptions,
  ) -> Result<Submission, SubmitError> {
    if !self.running {
      return Err(SubmitError::NotRunning);
    }
    if self.queue.len() >= self.config.max_queue_size {
      warn!(%task_type, capacity = self.config.max_queue_size, "Queue full, rejecting task");
      return Err(SubmitError::QueueFull { capacity: self.config.max_queue_size });
    }

    let spec = TaskSpec {
      task_type,
      payload,
      priority: options.priority.unwrap_or_default(),
      timeout: options.timeout.unwrap_or(self.config.default_task_timeout),
      max_retries: options.max_retries.unwrap_or(self.config.default_max_retries),
      retry_delay: options.retry_delay.unwrap_or(self.config.default_retry_delay),
    };
    let (tx, rx) = oneshot::channel();
    let task = Task::new(spec, tx);
    let task_id = task.id;
    let queued = task.queued();
    self.registry.insert(task);
    debug!(%task_id, %task_type, priority = ?queued.priority, "Task submitted");
    self.enqueue(queued);
    Ok((task_id, rx))
  }

  fn cancel(&mut self, task_id: Uuid) -> CancelOutcome {
    let was_queued = self.queue.remove(task_id);
    let outcome = self.registry.cancel(task_id);
    if outcome == CancelOutcome::Cancelled {
      info!(%task_id, was_queued, "Task cancelled");
    }
    outcome
  }

  fn stats(&self) -> PoolStats {
    PoolStats {
      running: self.running,
      worker_count: self.workers.len(),
      idle_workers: self.workers.count(WorkerStatus::Idle),
      busy_workers: self.workers.count(WorkerStatus::Busy),
      queued_tasks: self.queue.len(),
      active_tasks: self.registry.len().saturating_sub(self.queue.len()),
      tasks_by_type: self.registry.counts_by_type(),
      tasks_by_status: self.registry.counts_by_status(),
    }
  }

  fn enqueue(&mut self, task: QueuedTask) {
    self.queue.push(task);
    self.assign_idle();
  }

  fn assign_idle(&mut self) {
    for worker_id in self.workers.idle_ids() {
      if self.queue.is_empty() {
        break;
      }
      self.assign(worker_id);
    }
  }

  /// Hands the best-fit queued task to an idle worker.
  fn assign(&mut self, worker_id: WorkerId) -> bool {
    let Some(record) = self.workers.get(worker_id) else {
      return false;
    };
    if record.status != WorkerStatus::Idle {
      return false;
    }
    let affinity = if self.config.affinity_enabled { record.affinity.as_ref() } else { None };
    let Some(next) = self.queue.pop_for(affinity) else {
      return false;
    };
    let Some(task) = self.registry.get(next.id) else {
      warn!(task_id = %next.id, "Queued task missing from registry");
      return false;
    };
    let command = WorkerCommand::Task {
      task_id: next.id,
      task_type: next.task_type,
      payload: task.payload.clone(),
    };

    let Some(record) = self.workers.get_mut(worker_id) else {
      return false;
    };
    if !record.send(command) {
      warn!(worker_id, task_id = %next.id, "Worker runtime gone, requeueing task");
      self.queue.push(next);
      return false;
    }
    record.set_busy(next.id);
    self.registry.mark_dispatched(next.id, worker_id);
    debug!(worker_id, task_id = %next.id, task_type = %next.task_type, "Task assigned");
    true
  }

  fn start_worker(&mut self) -> Option<WorkerId> {
    let events = self.inbox.upgrade()?;
    let worker_id = self.workers.allocate_id();
    let handle = spawn_worker(worker_id, self.handlers.clone(), events);
    self.workers.insert(WorkerRecord::new(worker_id, handle));
    info!(worker_id, "Worker started");
    Some(worker_id)
  }

  /// Asks a worker to exit and arms the grace deadline. Waiters are woken
  /// once the record is gone, whichever way it goes.
  fn stop_worker(&mut self, worker_id: WorkerId, waiter: Option<oneshot::Sender<()>>) {
    let already_stopping = match self.workers.get(worker_id) {
      Some(record) => record.status == WorkerStatus::Stopping,
      None => {
        if let Some(waiter) = waiter {
          let _ = waiter.send(());
        }
        return;
      }
    };
    let deadline = if already_stopping {
      None
    } else {
      self.schedule(self.config.worker_stop_grace, Timer::StopDeadline { worker_id })
    };

    let Some(record) = self.workers.get_mut(worker_id) else {
      return;
    };
    record.stop_waiters.extend(waiter);
    if already_stopping {
      return;
    }
    record.status = WorkerStatus::Stopping;
    record.current_task = None;
    record.stop_timer = deadline;
    if !record.send(WorkerCommand::Terminate) {
      debug!(worker_id, "Terminate not delivered, waiting for exit report");
    }
    info!(worker_id, "Stopping worker");
  }

  fn finish_stop(&mut self, worker_id: WorkerId) {
    let Some(record) = self.workers.remove(worker_id) else {
      return;
    };
    let replace = record.replace_on_exit;
    record.dispose();
    info!(worker_id, "Worker stopped");
    if replace && self.running {
      self.start_worker();
    }
  }

  fn handle_crash(&mut self, worker_id: WorkerId, detail: String) {
    let Some(status) = self.workers.get(worker_id).map(|r| r.status) else {
      debug!(worker_id, "Crash report for unknown worker");
      return;
    };
    if status == WorkerStatus::Stopping {
      self.finish_stop(worker_id);
      return;
    }
    let Some(mut record) = self.workers.remove(worker_id) else {
      return;
    };
    record.status = WorkerStatus::Crashed;
    let in_flight = record.current_task.take();
    error!(worker_id, task_id = ?in_flight, "Worker crashed: {}", detail);
    record.dispose();

    if let Some(task_id) = in_flight {
      self.fail_task(task_id, FailureCause::WorkerCrash { worker_id, detail });
    }
    if self.running {
      self.start_worker();
    }
  }

  fn fail_task(&mut self, task_id: Uuid, cause: FailureCause) {
    match self.registry.fail(task_id, cause) {
      Some(FailureOutcome::Retry { delay }) => {
        info!(%task_id, ?delay, "Task failed, scheduling retry");
        if let Some(timer) = self.schedule(delay, Timer::RetryDue { task_id }) {
          self.registry.set_timer(task_id, timer);
        }
      }
      Some(FailureOutcome::Exhausted) => warn!(%task_id, "Task failed, retries exhausted"),
      None => debug!(%task_id, "Failure for task no longer registered, discarding"),
    }
  }

  /// True when the task is registered and was handed to this worker.
  fn is_assigned_to(&self, task_id: Uuid, worker_id: WorkerId) -> bool {
    self.registry.get(task_id).is_some_and(|task| task.worker_id == Some(worker_id))
  }

  fn handle_worker_event(&mut self, signal: WorkerSignal) {
    let WorkerSignal { worker_id, event } = signal;
    match event {
      WorkerEvent::Ready => {
        let Some(record) = self.workers.get_mut(worker_id) else {
          return;
        };
        if record.status == WorkerStatus::Starting {
          record.set_idle();
          debug!(worker_id, "Worker ready");
          self.assign(worker_id);
        }
      }
      WorkerEvent::Busy { task_id } => {
        let Some(record) = self.workers.get_mut(worker_id) else {
          return;
        };
        if record.status != WorkerStatus::Stopping {
          record.set_busy(task_id);
        }
        match self.registry.start_attempt(task_id, worker_id) {
          Some(attempt) => {
            let timer = Timer::TaskTimeout { task_id, attempt: attempt.attempt };
            if let Some(handle) = self.schedule(attempt.timeout, timer) {
              self.registry.set_timer(task_id, handle);
            }
          }
          None => debug!(worker_id, %task_id, "Busy acknowledgment for inactive task"),
        }
      }
      WorkerEvent::Idle => {
        let Some(record) = self.workers.get_mut(worker_id) else {
          return;
        };
        if record.status == WorkerStatus::Busy {
          record.set_idle();
          self.assign(worker_id);
        }
      }
      WorkerEvent::Result { task_id, value } => {
        if let Some(record) = self.workers.get_mut(worker_id) {
          record.tasks_processed += 1;
        }
        if !self.is_assigned_to(task_id, worker_id) || !self.registry.complete(task_id, value) {
          debug!(worker_id, %task_id, "Discarding result for inactive task");
          return;
        }
        info!(worker_id, %task_id, "Task completed");
      }
      WorkerEvent::Error { task_id, detail } => {
        if let Some(record) = self.workers.get_mut(worker_id) {
          record.tasks_failed += 1;
        }
        if !self.is_assigned_to(task_id, worker_id) {
          debug!(worker_id, %task_id, "Discarding error for inactive task: {}", detail);
          return;
        }
        self.fail_task(task_id, FailureCause::Handler(detail));
      }
      WorkerEvent::FatalError { detail } => self.handle_crash(worker_id, detail),
      WorkerEvent::Metrics(metrics) => {
        if let Some(record) = self.workers.get_mut(worker_id) {
          record.record_metrics(&metrics);
        }
      }
      WorkerEvent::Exited { graceful } => {
        let detail = if graceful {
          "worker exited without being asked to stop"
        } else {
          "worker runtime terminated abnormally"
        };
        self.handle_crash(worker_id, detail.to_string());
      }
    }
  }

  fn handle_timer(&mut self, timer: Timer) {
    match timer {
      Timer::TaskTimeout { task_id, attempt } => {
        let Some(worker_id) = self.registry.time_out(task_id, attempt) else {
          return;
        };
        warn!(%task_id, worker_id = ?worker_id, "Task timed out");
        let Some(worker_id) = worker_id else {
          return;
        };
        let stuck = self
          .workers
          .get(worker_id)
          .is_some_and(|record| record.status == WorkerStatus::Busy && record.current_task == Some(task_id));
        if stuck {
          warn!(worker_id, "Worker stuck on timed out task, replacing");
          if let Some(record) = self.workers.get_mut(worker_id) {
            record.replace_on_exit = true;
          }
          self.stop_worker(worker_id, None);
        }
      }
      Timer::RetryDue { task_id } => {
        if !self.running {
          return;
        }
        if let Some(queued) = self.registry.reset_for_retry(task_id) {
          let retries = self.registry.get(task_id).map(|t| t.retries).unwrap_or_default();
          info!(%task_id, retries, "Requeueing task for retry");
          self.enqueue(queued);
        }
      }
      Timer::StopDeadline { worker_id } => {
        if self.workers.get(worker_id).is_some_and(|r| r.status == WorkerStatus::Stopping) {
          warn!(worker_id, "Worker did not exit within grace period, aborting");
          self.finish_stop(worker_id);
        }
      }
      Timer::AutoscaleTick => self.autoscale(),
    }
  }

  fn request_all_metrics(&self) -> usize {
    self
      .workers
      .live()
      .filter(|record| record.send(WorkerCommand::GetMetrics))
      .count()
  }

  fn autoscale(&mut self) {
    if !self.running {
      return;
    }
    self.request_all_metrics();

    let snapshot = LoadSnapshot {
      workers: self
        .workers
        .live()
        .map(|record| WorkerLoad {
          id: record.id,
          status: record.status,
          cpu: record.cpu_usage,
          last_activity: record.last_activity,
        })
        .collect(),
      queued: self.queue.len(),
    };
    let plan = autoscaler::plan(&snapshot, &self.config, Utc::now());
    debug!(
      workers = snapshot.workers.len(),
      idle = self.workers.count(WorkerStatus::Idle),
      busy = self.workers.count(WorkerStatus::Busy),
      queued = snapshot.queued,
      avg_cpu = plan.signals.avg_cpu,
      queue_pressure = plan.signals.queue_pressure,
      idle_ratio = plan.signals.idle_ratio,
      "Pool gauges"
    );

    match plan.decision {
      ScaleDecision::Up(count) => {
        info!(count, current = snapshot.workers.len(), "Scaling up");
        for _ in 0..count {
          self.start_worker();
        }
      }
      ScaleDecision::Down(worker_ids) => {
        info!(count = worker_ids.len(), current = snapshot.workers.len(), "Scaling down");
        for worker_id in worker_ids {
          self.stop_worker(worker_id, None);
        }
      }
      ScaleDecision::Hold => {}
    }
    for worker_id in plan.evict {
      info!(worker_id, "Stopping worker past idle timeout");
      self.stop_worker(worker_id, None);
    }
  }

  fn schedule(&self, delay: Duration, timer: Timer) -> Option<JoinHandle<()>> {
    let inbox = self.inbox.upgrade()?;
    Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let _ = inbox.send(Message::Timer(timer));
    }))
  }

  fn spawn_autoscale_loop(&self) -> Option<JoinHandle<()>> {
    let inbox = self.inbox.upgrade()?;
    let period = self.config.autoscale_interval;
    Some(tokio::spawn(async move {
      let mut interval = tokio::time::interval_at(Instant::now() + period, period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        if inbox.send(Message::Timer(Timer::AutoscaleTick)).is_err() {
          break;
        }
      }
    }))
  }
}
