use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
  DepositProcessing,
  WithdrawalProcessing,
  BlockFinalization,
  TransactionVerification,
  SignatureVerification,
  MetricsCollection,
  CacheCleanup,
  DatabaseMaintenance,
}

impl TaskType {
  pub const ALL: [TaskType; 8] = [
    TaskType::DepositProcessing,
    TaskType::WithdrawalProcessing,
    TaskType::BlockFinalization,
    TaskType::TransactionVerification,
    TaskType::SignatureVerification,
    TaskType::MetricsCollection,
    TaskType::CacheCleanup,
    TaskType::DatabaseMaintenance,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      TaskType::DepositProcessing => "deposit-processing",
      TaskType::WithdrawalProcessing => "withdrawal-processing",
      TaskType::BlockFinalization => "block-finalization",
      TaskType::TransactionVerification => "transaction-verification",
      TaskType::SignatureVerification => "signature-verification",
      TaskType::MetricsCollection => "metrics-collection",
      TaskType::CacheCleanup => "cache-cleanup",
      TaskType::DatabaseMaintenance => "database-maintenance",
    }
  }
}

impl fmt::Display for TaskType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    TaskType::ALL
      .into_iter()
      .find(|t| t.as_str() == s)
      .ok_or_else(|| format!("unknown task type: {s}"))
  }
}

/// Queue ordering weight. Variant order is the priority order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
  Low,
  #[default]
  Normal,
  High,
  Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Queued,
  Running,
  Completed,
  Failed,
  Retrying,
  Timeout,
  Cancelled,
}

impl TaskStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
  Starting,
  Idle,
  Busy,
  Stopping,
  Crashed,
}

/// Per-submission overrides. Unset fields fall back to the pool defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOptions {
  pub priority: Option<TaskPriority>,
  pub timeout: Option<Duration>,
  pub max_retries: Option<u32>,
  pub retry_delay: Option<Duration>,
}

impl TaskOptions {
  pub fn priority(mut self, priority: TaskPriority) -> Self {
    self.priority = Some(priority);
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }

  pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
    self.retry_delay = Some(retry_delay);
    self
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
  pub id: Uuid,
  pub task_type: TaskType,
  pub priority: TaskPriority,
  pub status: TaskStatus,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub worker_id: Option<u64>,
  pub retries: u32,
  pub max_retries: u32,
  pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
  /// Share of wall time spent inside handlers since the previous sample.
  pub cpu: f64,
  /// Resident memory of the hosting process, in bytes.
  pub memory: u64,
  pub processed: u64,
  pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
  pub id: u64,
  pub status: WorkerStatus,
  pub current_task_id: Option<Uuid>,
  pub created_at: DateTime<Utc>,
  pub last_activity: DateTime<Utc>,
  pub tasks_processed: u64,
  pub tasks_failed: u64,
  pub affinity: Option<Vec<TaskType>>,
  pub cpu_usage: Option<f64>,
  pub memory_usage: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
  pub running: bool,
  pub worker_count: usize,
  pub idle_workers: usize,
  pub busy_workers: usize,
  pub queued_tasks: usize,
  pub active_tasks: usize,
  pub tasks_by_type: BTreeMap<TaskType, usize>,
  pub tasks_by_status: BTreeMap<TaskStatus, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
  Cancelled,
  NotFound,
  AlreadyTerminal,
}
