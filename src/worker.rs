//! Worker runtime: one tokio task per worker executing the dispatch table,
//! plus a watcher that reports how the task ended.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::messaging::{WorkerCommand, WorkerEvent, WorkerId, WorkerSignal};
use crate::models::{TaskType, WorkerMetrics};
use crate::worker_processing::{HandlerTable, ProcessProbe, TaskContext};

/// Coordinator-side ownership of a running worker runtime.
#[derive(Debug)]
pub struct WorkerHandle {
  commands: mpsc::UnboundedSender<WorkerCommand>,
  abort: AbortHandle,
}

impl WorkerHandle {
  /// Returns false when the runtime is gone; its watcher reports the exit.
  pub fn send(&self, command: WorkerCommand) -> bool {
    self.commands.send(command).is_ok()
  }

  pub fn abort(&self) {
    self.abort.abort();
  }
}

/// Starts a worker runtime. Readiness is announced later with
/// [`WorkerEvent::Ready`] from inside the runtime.
pub fn spawn_worker<T>(
  worker_id: WorkerId,
  handlers: Arc<HandlerTable>,
  events: mpsc::UnboundedSender<T>,
) -> WorkerHandle
where
  T: From<WorkerSignal> + Send + 'static,
{
  let (commands_tx, commands_rx) = mpsc::unbounded_channel();
  let runtime = WorkerRuntime {
    worker_id,
    handlers,
    events: events.clone(),
    processed: 0,
    failed: 0,
    busy_since_sample: Duration::ZERO,
    running_since: None,
    last_sample: Instant::now(),
    probe: ProcessProbe::new(),
  };
  let join = tokio::spawn(runtime.run(commands_rx));
  let abort = join.abort_handle();

  tokio::spawn(async move {
    let outcome = join.await;
    for event in exit_events(outcome) {
      let _ = events.send(T::from(WorkerSignal { worker_id, event }));
    }
  });

  WorkerHandle { commands: commands_tx, abort }
}

fn exit_events(outcome: Result<(), JoinError>) -> Vec<WorkerEvent> {
  match outcome {
    Ok(()) => vec![WorkerEvent::Exited { graceful: true }],
    Err(err) if err.is_panic() => {
      let detail = panic_detail(err.into_panic());
      vec![WorkerEvent::FatalError { detail }, WorkerEvent::Exited { graceful: false }]
    }
    Err(_) => vec![WorkerEvent::Exited { graceful: false }],
  }
}

fn panic_detail(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "worker runtime panicked".to_string()
  }
}

struct WorkerRuntime<T> {
  worker_id: WorkerId,
  handlers: Arc<HandlerTable>,
  events: mpsc::UnboundedSender<T>,
  processed: u64,
  failed: u64,
  busy_since_sample: Duration,
  /// Set while a handler runs; busy time up to here is not yet counted.
  running_since: Option<Instant>,
  last_sample: Instant,
  probe: ProcessProbe,
}

impl<T> WorkerRuntime<T>
where
  T: From<WorkerSignal> + Send + 'static,
{
  async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
    self.emit(WorkerEvent::Ready);
    debug!(worker_id = self.worker_id, "Worker ready");

    let mut deferred = VecDeque::new();
    loop {
      let command = match deferred.pop_front() {
        Some(command) => command,
        None => match commands.recv().await {
          Some(command) => command,
          None => break,
        },
      };
      match command {
        WorkerCommand::Task { task_id, task_type, payload } => {
          self.run_task(task_id, task_type, payload, &mut commands, &mut deferred).await;
        }
        WorkerCommand::GetMetrics => {
          let metrics = self.sample_metrics();
          self.emit(WorkerEvent::Metrics(metrics));
        }
        WorkerCommand::Terminate => {
          info!(worker_id = self.worker_id, "Worker terminating");
          break;
        }
      }
    }
  }

  /// Runs one handler to completion. Metrics requests are answered while it
  /// runs; any other command waits in `deferred` until it is done.
  async fn run_task(
    &mut self,
    task_id: Uuid,
    task_type: TaskType,
    payload: Value,
    commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    deferred: &mut VecDeque<WorkerCommand>,
  ) {
    self.emit(WorkerEvent::Busy { task_id });
    let ctx = TaskContext { task_id, task_type, worker_id: self.worker_id };
    let handlers = self.handlers.clone();
    let dispatch = handlers.dispatch(ctx, payload);
    tokio::pin!(dispatch);

    self.running_since = Some(Instant::now());
    let mut inbox_open = true;
    let outcome = loop {
      tokio::select! {
        outcome = &mut dispatch => break outcome,
        command = commands.recv(), if inbox_open => match command {
          Some(WorkerCommand::GetMetrics) => {
            let metrics = self.sample_metrics();
            self.emit(WorkerEvent::Metrics(metrics));
          }
          Some(command) => deferred.push_back(command),
          None => inbox_open = false,
        },
      }
    };
    if let Some(since) = self.running_since.take() {
      self.busy_since_sample += since.elapsed();
    }

    match outcome {
      Ok(value) => {
        self.processed += 1;
        self.emit(WorkerEvent::Result { task_id, value });
      }
      Err(e) => {
        self.failed += 1;
        warn!(worker_id = self.worker_id, %task_id, %task_type, "Task handler failed: {:#}", e);
        self.emit(WorkerEvent::Error { task_id, detail: format!("{:#}", e) });
      }
    }
    self.emit(WorkerEvent::Idle);
  }

  fn sample_metrics(&mut self) -> WorkerMetrics {
    let now = Instant::now();
    if let Some(since) = self.running_since.as_mut() {
      self.busy_since_sample += now.duration_since(*since);
      *since = now;
    }
    let elapsed = now.duration_since(self.last_sample);
    let cpu = if elapsed.is_zero() {
      0.0
    } else {
      (self.busy_since_sample.as_secs_f64() / elapsed.as_secs_f64() * 100.0).min(100.0)
    };
    self.busy_since_sample = Duration::ZERO;
    self.last_sample = now;
    WorkerMetrics {
      cpu,
      memory: self.probe.sample().memory,
      processed: self.processed,
      failed: self.failed,
    }
  }

  fn emit(&self, event: WorkerEvent) {
    let signal = WorkerSignal { worker_id: self.worker_id, event };
    if self.events.send(T::from(signal)).is_err() {
      error!(worker_id = self.worker_id, "Coordinator channel closed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  async fn next_event(rx: &mut mpsc::UnboundedReceiver<WorkerSignal>) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
      .await
      .expect("worker event")
      .expect("channel open")
      .event
  }

  #[tokio::test]
  async fn reports_lifecycle_in_order() {
    let handlers = Arc::new(
      HandlerTable::new().with_fn(TaskType::CacheCleanup, |_ctx, _payload| async { Ok(json!("done")) }),
    );
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerSignal>();
    let worker = spawn_worker(7, handlers, tx);

    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Ready));

    let task_id = Uuid::new_v4();
    assert!(worker.send(WorkerCommand::Task { task_id, task_type: TaskType::CacheCleanup, payload: json!({}) }));
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Busy { task_id: id } if id == task_id));
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Result { value, .. } if value == json!("done")));
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Idle));

    assert!(worker.send(WorkerCommand::GetMetrics));
    match next_event(&mut rx).await {
      WorkerEvent::Metrics(m) => assert_eq!((m.processed, m.failed), (1, 0)),
      other => panic!("unexpected event {other:?}"),
    }

    assert!(worker.send(WorkerCommand::Terminate));
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Exited { graceful: true }));
  }

  #[tokio::test]
  async fn panic_reports_fatal_error_then_exit() {
    let handlers = Arc::new(HandlerTable::new().with_fn(TaskType::BlockFinalization, |_ctx, _payload| async {
      let client: Option<serde_json::Value> = None;
      Ok(client.expect("rpc client poisoned"))
    }));
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerSignal>();
    let worker = spawn_worker(3, handlers, tx);
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Ready));

    worker.send(WorkerCommand::Task {
      task_id: Uuid::new_v4(),
      task_type: TaskType::BlockFinalization,
      payload: json!(null),
    });
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Busy { .. }));
    match next_event(&mut rx).await {
      WorkerEvent::FatalError { detail } => assert!(detail.contains("rpc client poisoned")),
      other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Exited { graceful: false }));
  }

  #[tokio::test]
  async fn answers_metrics_while_a_handler_runs() {
    let handlers = Arc::new(HandlerTable::new().with_fn(TaskType::BlockFinalization, |_ctx, _payload| async {
      tokio::time::sleep(Duration::from_millis(300)).await;
      Ok(json!("finalized"))
    }));
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerSignal>();
    let worker = spawn_worker(5, handlers, tx);
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Ready));

    worker.send(WorkerCommand::Task {
      task_id: Uuid::new_v4(),
      task_type: TaskType::BlockFinalization,
      payload: json!(null),
    });
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Busy { .. }));

    for _ in 0..3 {
      tokio::time::sleep(Duration::from_millis(50)).await;
      assert!(worker.send(WorkerCommand::GetMetrics));
      match next_event(&mut rx).await {
        WorkerEvent::Metrics(m) => assert!(m.cpu > 50.0, "busy worker reported cpu {}", m.cpu),
        other => panic!("unexpected event {other:?}"),
      }
    }
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Result { .. }));
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Idle));
  }

  #[tokio::test]
  async fn terminate_waits_for_the_running_handler() {
    let handlers = Arc::new(HandlerTable::new().with_fn(TaskType::CacheCleanup, |_ctx, _payload| async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(json!("swept"))
    }));
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerSignal>();
    let worker = spawn_worker(6, handlers, tx);
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Ready));

    worker.send(WorkerCommand::Task { task_id: Uuid::new_v4(), task_type: TaskType::CacheCleanup, payload: json!({}) });
    worker.send(WorkerCommand::Terminate);
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Busy { .. }));
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Result { .. }));
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Idle));
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Exited { graceful: true }));
  }
}
