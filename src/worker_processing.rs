use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::messaging::WorkerId;
use crate::models::TaskType;

/// What a handler knows about the task it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
  pub task_id: Uuid,
  pub task_type: TaskType,
  pub worker_id: WorkerId,
}

/// Body of one task type. Returning `Err` fails the attempt; panicking
/// brings the whole worker down.
#[async_trait]
pub trait TaskHandler: Send + Sync {
  async fn handle(&self, ctx: TaskContext, payload: Value) -> Result<Value>;
}

struct FnHandler<F> {
  f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
  F: Fn(TaskContext, Value) -> Fut + Send + Sync,
  Fut: Future<Output = Result<Value>> + Send,
{
  async fn handle(&self, ctx: TaskContext, payload: Value) -> Result<Value> {
    (self.f)(ctx, payload).await
  }
}

/// Dispatch table shared by every worker runtime of a pool.
#[derive(Clone, Default)]
pub struct HandlerTable {
  handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> &mut Self {
    self.handlers.insert(task_type, handler);
    self
  }

  pub fn with(mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
    self.register(task_type, handler);
    self
  }

  pub fn with_fn<F, Fut>(self, task_type: TaskType, f: F) -> Self
  where
    F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    self.with(task_type, Arc::new(FnHandler { f }))
  }

  pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
    self.handlers.get(&task_type).cloned()
  }

  pub fn task_types(&self) -> Vec<TaskType> {
    let mut types: Vec<TaskType> = self.handlers.keys().copied().collect();
    types.sort();
    types
  }

  pub async fn dispatch(&self, ctx: TaskContext, payload: Value) -> Result<Value> {
    let handler = self
      .get(ctx.task_type)
      .ok_or_else(|| anyhow!("no handler registered for task type {}", ctx.task_type))?;
    handler.handle(ctx, payload).await
  }
}

impl fmt::Debug for HandlerTable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HandlerTable").field("task_types", &self.task_types()).finish()
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessUsage {
  pub cpu: f32,
  pub memory: u64,
}

/// Samples CPU and resident memory of the current process.
pub struct ProcessProbe {
  system: System,
  pid: Option<Pid>,
}

impl ProcessProbe {
  pub fn new() -> Self {
    Self {
      system: System::new(),
      pid: sysinfo::get_current_pid().ok(),
    }
  }

  pub fn sample(&mut self) -> ProcessUsage {
    let Some(pid) = self.pid else {
      return ProcessUsage::default();
    };
    self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    self
      .system
      .process(pid)
      .map(|p| ProcessUsage { cpu: p.cpu_usage(), memory: p.memory() })
      .unwrap_or_default()
  }
}

impl Default for ProcessProbe {
  fn default() -> Self {
    Self::new()
  }
}

/// Built-in `metrics-collection` handler: reports host process usage.
pub struct MetricsCollectionHandler {
  probe: Mutex<ProcessProbe>,
}

impl MetricsCollectionHandler {
  pub fn new() -> Self {
    Self { probe: Mutex::new(ProcessProbe::new()) }
  }
}

impl Default for MetricsCollectionHandler {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl TaskHandler for MetricsCollectionHandler {
  async fn handle(&self, ctx: TaskContext, _payload: Value) -> Result<Value> {
    let usage = self.probe.lock().await.sample();
    info!(worker_id = ctx.worker_id, task_id = %ctx.task_id, "Collected process metrics");
    Ok(json!({
      "cpu": usage.cpu,
      "memory": usage.memory,
      "collected_at": chrono::Utc::now(),
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ctx(task_type: TaskType) -> TaskContext {
    TaskContext { task_id: Uuid::new_v4(), task_type, worker_id: 1 }
  }

  #[tokio::test]
  async fn dispatches_to_registered_closure() {
    let table = HandlerTable::new()
      .with_fn(TaskType::SignatureVerification, |_ctx, payload| async move {
        Ok(json!({ "verified": payload["sig"] == "ok" }))
      });

    let out = table
      .dispatch(ctx(TaskType::SignatureVerification), json!({ "sig": "ok" }))
      .await
      .unwrap();
    assert_eq!(out, json!({ "verified": true }));
  }

  #[tokio::test]
  async fn unknown_type_is_an_error() {
    let table = HandlerTable::new();
    let err = table.dispatch(ctx(TaskType::CacheCleanup), Value::Null).await.unwrap_err();
    assert!(err.to_string().contains("cache-cleanup"));
  }

  #[tokio::test]
  async fn metrics_handler_reports_usage() {
    let table = HandlerTable::new()
      .with(TaskType::MetricsCollection, Arc::new(MetricsCollectionHandler::new()));
    let out = table.dispatch(ctx(TaskType::MetricsCollection), Value::Null).await.unwrap();
    assert!(out.get("memory").is_some());
    assert!(out.get("collected_at").is_some());
  }
}
