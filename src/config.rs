use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

#[derive(Debug, Clone)]
pub struct Config {
  pub server_port: u16,
  pub pool: PoolConfig,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let pool = PoolConfig::from_env()?;
    pool.validate()?;
    Ok(Self {
      server_port: env_or("SERVER_PORT", 8080)?,
      pool,
    })
  }
}

/// Tuning knobs for the worker pool, its queue and the autoscaler.
#[derive(Debug, Clone)]
pub struct PoolConfig {
  pub min_workers: usize,
  pub max_workers: usize,
  pub autoscaling_enabled: bool,
  pub autoscale_interval: Duration,
  /// Average worker CPU (percent) above which the pool grows.
  pub scale_up_cpu_threshold: f64,
  /// Average worker CPU (percent) below which the pool may shrink.
  pub scale_down_cpu_threshold: f64,
  pub worker_idle_timeout: Duration,
  pub max_queue_size: usize,
  pub default_task_timeout: Duration,
  pub default_max_retries: u32,
  pub default_retry_delay: Duration,
  pub affinity_enabled: bool,
  /// How long a stopping worker may take to exit before it is aborted.
  pub worker_stop_grace: Duration,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      min_workers: 2,
      max_workers: 8,
      autoscaling_enabled: true,
      autoscale_interval: Duration::from_secs(10),
      scale_up_cpu_threshold: 75.0,
      scale_down_cpu_threshold: 25.0,
      worker_idle_timeout: Duration::from_secs(60),
      max_queue_size: 1000,
      default_task_timeout: Duration::from_secs(30),
      default_max_retries: 3,
      default_retry_delay: Duration::from_secs(1),
      affinity_enabled: true,
      worker_stop_grace: Duration::from_secs(5),
    }
  }
}

impl PoolConfig {
  pub fn from_env() -> Result<Self> {
    let defaults = Self::default();
    Ok(Self {
      min_workers: env_or("POOL_MIN_WORKERS", defaults.min_workers)?,
      max_workers: env_or("POOL_MAX_WORKERS", defaults.max_workers)?,
      autoscaling_enabled: env_or("POOL_AUTOSCALING", defaults.autoscaling_enabled)?,
      autoscale_interval: env_millis("POOL_AUTOSCALE_INTERVAL_MS", defaults.autoscale_interval)?,
      scale_up_cpu_threshold: env_or("POOL_SCALE_UP_CPU", defaults.scale_up_cpu_threshold)?,
      scale_down_cpu_threshold: env_or("POOL_SCALE_DOWN_CPU", defaults.scale_down_cpu_threshold)?,
      worker_idle_timeout: env_millis("POOL_IDLE_TIMEOUT_MS", defaults.worker_idle_timeout)?,
      max_queue_size: env_or("POOL_MAX_QUEUE_SIZE", defaults.max_queue_size)?,
      default_task_timeout: env_millis("POOL_TASK_TIMEOUT_MS", defaults.default_task_timeout)?,
      default_max_retries: env_or("POOL_MAX_RETRIES", defaults.default_max_retries)?,
      default_retry_delay: env_millis("POOL_RETRY_DELAY_MS", defaults.default_retry_delay)?,
      affinity_enabled: env_or("POOL_AFFINITY", defaults.affinity_enabled)?,
      worker_stop_grace: env_millis("POOL_STOP_GRACE_MS", defaults.worker_stop_grace)?,
    })
  }

  pub fn validate(&self) -> Result<()> {
    if self.max_workers == 0 {
      bail!("max_workers must be at least 1");
    }
    if self.min_workers > self.max_workers {
      bail!("min_workers ({}) exceeds max_workers ({})", self.min_workers, self.max_workers);
    }
    if self.max_queue_size == 0 {
      bail!("max_queue_size must be at least 1");
    }
    if self.scale_down_cpu_threshold >= self.scale_up_cpu_threshold {
      bail!(
        "scale-down threshold ({}) must be below scale-up threshold ({})",
        self.scale_down_cpu_threshold,
        self.scale_up_cpu_threshold
      );
    }
    Ok(())
  }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match env::var(key) {
    Ok(raw) => raw.trim().parse().with_context(|| format!("invalid value for {key}: {raw:?}")),
    Err(_) => Ok(default),
  }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
  let millis = env_or(key, default.as_millis() as u64)?;
  Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    assert!(PoolConfig::default().validate().is_ok());
  }

  #[test]
  fn rejects_inverted_bounds() {
    let config = PoolConfig { min_workers: 4, max_workers: 2, ..PoolConfig::default() };
    assert!(config.validate().is_err());
  }

  #[test]
  fn rejects_overlapping_cpu_thresholds() {
    let config = PoolConfig {
      scale_up_cpu_threshold: 30.0,
      scale_down_cpu_threshold: 30.0,
      ..PoolConfig::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn zero_min_workers_is_allowed() {
    let config = PoolConfig { min_workers: 0, ..PoolConfig::default() };
    assert!(config.validate().is_ok());
  }
}
