//! Pool sizing decisions. The coordinator takes a [`LoadSnapshot`] on every
//! autoscale tick and applies the returned [`AutoscalePlan`].
//!
//! ```text
//! avg_cpu        = mean cpu of workers that reported one
//! queue_pressure = queued / max_queue_size
//! idle_ratio     = idle / live workers
//!
//! if (avg_cpu > up_threshold || queue_pressure > 0.7) && size < max:
//!     add min(ceil(size * 20%), max - size), at least 1
//! else if avg_cpu < down_threshold && queue_pressure < 0.3
//!         && idle_ratio > 0.5 && size > min:
//!     stop min(ceil(size * 10%), size - min) idle workers, oldest activity first
//!
//! then, always: stop idle workers past the idle timeout while size > min
//! ```

use chrono::{DateTime, Utc};

use crate::config::PoolConfig;
use crate::messaging::WorkerId;
use crate::models::WorkerStatus;

const SCALE_UP_QUEUE_PRESSURE: f64 = 0.7;
const SCALE_DOWN_QUEUE_PRESSURE: f64 = 0.3;
const SCALE_DOWN_IDLE_RATIO: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct WorkerLoad {
  pub id: WorkerId,
  pub status: WorkerStatus,
  pub cpu: Option<f64>,
  pub last_activity: DateTime<Utc>,
}

/// Live workers (not stopping) and the queue depth at tick time.
#[derive(Debug, Clone, Default)]
pub struct LoadSnapshot {
  pub workers: Vec<WorkerLoad>,
  pub queued: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSignals {
  pub avg_cpu: f64,
  pub queue_pressure: f64,
  pub idle_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
  Up(usize),
  Down(Vec<WorkerId>),
  Hold,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoscalePlan {
  pub signals: LoadSignals,
  pub decision: ScaleDecision,
  /// Idle-timeout evictions, disjoint from any scale-down.
  pub evict: Vec<WorkerId>,
}

impl LoadSnapshot {
  pub fn signals(&self, max_queue_size: usize) -> LoadSignals {
    let reported: Vec<f64> = self.workers.iter().filter_map(|w| w.cpu).collect();
    let avg_cpu = if reported.is_empty() {
      0.0
    } else {
      reported.iter().sum::<f64>() / reported.len() as f64
    };
    let queue_pressure = if max_queue_size == 0 {
      0.0
    } else {
      self.queued as f64 / max_queue_size as f64
    };
    let idle = self.workers.iter().filter(|w| w.status == WorkerStatus::Idle).count();
    let idle_ratio = if self.workers.is_empty() {
      0.0
    } else {
      idle as f64 / self.workers.len() as f64
    };
    LoadSignals { avg_cpu, queue_pressure, idle_ratio }
  }

  /// Idle workers, least recently active first.
  fn idle_by_age(&self) -> Vec<&WorkerLoad> {
    let mut idle: Vec<&WorkerLoad> =
      self.workers.iter().filter(|w| w.status == WorkerStatus::Idle).collect();
    idle.sort_by_key(|w| (w.last_activity, w.id));
    idle
  }
}

pub fn plan(snapshot: &LoadSnapshot, config: &PoolConfig, now: DateTime<Utc>) -> AutoscalePlan {
  let signals = snapshot.signals(config.max_queue_size);
  let size = snapshot.workers.len();

  let wants_up = signals.avg_cpu > config.scale_up_cpu_threshold
    || signals.queue_pressure > SCALE_UP_QUEUE_PRESSURE;
  let wants_down = signals.avg_cpu < config.scale_down_cpu_threshold
    && signals.queue_pressure < SCALE_DOWN_QUEUE_PRESSURE
    && signals.idle_ratio > SCALE_DOWN_IDLE_RATIO;

  let decision = if wants_up && size < config.max_workers {
    let step = size.div_ceil(5).max(1);
    ScaleDecision::Up(step.min(config.max_workers - size))
  } else if wants_down && size > config.min_workers {
    let step = size.div_ceil(10).min(size - config.min_workers);
    let chosen: Vec<WorkerId> = snapshot.idle_by_age().into_iter().take(step).map(|w| w.id).collect();
    if chosen.is_empty() { ScaleDecision::Hold } else { ScaleDecision::Down(chosen) }
  } else {
    ScaleDecision::Hold
  };

  let mut remaining = match &decision {
    ScaleDecision::Up(n) => size + n,
    ScaleDecision::Down(ids) => size - ids.len(),
    ScaleDecision::Hold => size,
  };
  let already_stopping: &[WorkerId] = match &decision {
    ScaleDecision::Down(ids) => ids,
    _ => &[],
  };

  let mut evict = Vec::new();
  for worker in snapshot.idle_by_age() {
    if remaining <= config.min_workers {
      break;
    }
    if already_stopping.contains(&worker.id) {
      continue;
    }
    let idle_for = now.signed_duration_since(worker.last_activity);
    if idle_for.num_milliseconds() > config.worker_idle_timeout.as_millis() as i64 {
      evict.push(worker.id);
      remaining -= 1;
    }
  }

  AutoscalePlan { signals, decision, evict }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  fn config() -> PoolConfig {
    PoolConfig {
      min_workers: 2,
      max_workers: 8,
      max_queue_size: 100,
      worker_idle_timeout: Duration::from_secs(60),
      ..PoolConfig::default()
    }
  }

  fn worker(id: WorkerId, status: WorkerStatus, cpu: Option<f64>, idle_secs: i64) -> WorkerLoad {
    WorkerLoad { id, status, cpu, last_activity: Utc::now() - chrono::Duration::seconds(idle_secs) }
  }

  #[test]
  fn hot_cpu_grows_until_max() {
    let config = config();
    let mut snapshot = LoadSnapshot {
      workers: (1..=2).map(|id| worker(id, WorkerStatus::Busy, Some(90.0), 0)).collect(),
      queued: 0,
    };

    let mut sizes = vec![snapshot.workers.len()];
    for _ in 0..20 {
      match plan(&snapshot, &config, Utc::now()).decision {
        ScaleDecision::Up(n) => {
          assert!(n >= 1);
          let next = snapshot.workers.len() as u64 + 1;
          for id in next..next + n as u64 {
            snapshot.workers.push(worker(id, WorkerStatus::Busy, Some(90.0), 0));
          }
          sizes.push(snapshot.workers.len());
        }
        ScaleDecision::Hold => break,
        ScaleDecision::Down(_) => panic!("hot pool must not shrink"),
      }
    }

    assert!(sizes.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(*sizes.last().unwrap(), config.max_workers);
    assert_eq!(plan(&snapshot, &config, Utc::now()).decision, ScaleDecision::Hold);
  }

  #[test]
  fn queue_pressure_alone_scales_up() {
    let snapshot = LoadSnapshot {
      workers: (1..=5).map(|id| worker(id, WorkerStatus::Busy, None, 0)).collect(),
      queued: 80,
    };
    let plan = plan(&snapshot, &config(), Utc::now());
    assert_eq!(plan.decision, ScaleDecision::Up(1));
    assert!(plan.signals.queue_pressure > 0.7);
  }

  #[test]
  fn cold_pool_sheds_oldest_idle_first() {
    let config = PoolConfig { min_workers: 1, max_workers: 20, ..config() };
    let mut workers: Vec<WorkerLoad> =
      (1..=12).map(|id| worker(id, WorkerStatus::Idle, Some(1.0), 10)).collect();
    workers[6].last_activity = Utc::now() - chrono::Duration::seconds(50);
    workers[3].last_activity = Utc::now() - chrono::Duration::seconds(40);
    let snapshot = LoadSnapshot { workers, queued: 0 };

    let plan = plan(&snapshot, &config, Utc::now());
    assert_eq!(plan.decision, ScaleDecision::Down(vec![7, 4]));
    assert!(plan.evict.is_empty());
  }

  #[test]
  fn scale_down_never_goes_below_min() {
    let snapshot = LoadSnapshot {
      workers: (1..=2).map(|id| worker(id, WorkerStatus::Idle, Some(0.0), 600)).collect(),
      queued: 0,
    };
    let plan = plan(&snapshot, &config(), Utc::now());
    assert_eq!(plan.decision, ScaleDecision::Hold);
    assert!(plan.evict.is_empty());
  }

  #[test]
  fn idle_timeout_evicts_alongside_scale_up() {
    let config = PoolConfig { min_workers: 1, ..config() };
    let snapshot = LoadSnapshot {
      workers: vec![
        worker(1, WorkerStatus::Busy, Some(99.0), 0),
        worker(2, WorkerStatus::Idle, Some(95.0), 120),
        worker(3, WorkerStatus::Idle, Some(95.0), 5),
      ],
      queued: 0,
    };
    let plan = plan(&snapshot, &config, Utc::now());
    assert_eq!(plan.decision, ScaleDecision::Up(1));
    assert_eq!(plan.evict, vec![2]);
  }

  #[test]
  fn busy_workers_are_never_evicted() {
    let config = PoolConfig { min_workers: 0, ..config() };
    let snapshot = LoadSnapshot {
      workers: vec![worker(1, WorkerStatus::Busy, Some(50.0), 600)],
      queued: 0,
    };
    assert!(plan(&snapshot, &config, Utc::now()).evict.is_empty());
  }
}
