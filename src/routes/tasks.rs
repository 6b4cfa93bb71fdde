use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;
use warp::Filter;
use warp::http::StatusCode;

use super::{ApiError, reject, with_pool};
use crate::error::{SubmitError, TaskError};
use crate::models::{CancelOutcome, TaskOptions, TaskPriority, TaskStatus, TaskType};
use crate::pool::WorkerPool;

#[derive(Debug, Deserialize)]
pub struct NewTask {
  pub task_type: TaskType,
  #[serde(default)]
  pub payload: Value,
  pub priority: Option<TaskPriority>,
  pub timeout_ms: Option<u64>,
  pub max_retries: Option<u32>,
  pub retry_delay_ms: Option<u64>,
}

impl NewTask {
  fn options(&self) -> TaskOptions {
    TaskOptions {
      priority: self.priority,
      timeout: self.timeout_ms.map(Duration::from_millis),
      max_retries: self.max_retries,
      retry_delay: self.retry_delay_ms.map(Duration::from_millis),
    }
  }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
  pub task_id: Option<Uuid>,
  pub status: TaskStatus,
  pub result: Option<Value>,
  pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
  pub task_id: Uuid,
  pub outcome: CancelOutcome,
  pub cancelled: bool,
}

const MAX_BODY_BYTES: u64 = 64 * 1024;

pub fn task_routes(pool: WorkerPool) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  submit_route(pool.clone())
    .or(list_route(pool.clone()))
    .or(status_route(pool.clone()))
    .or(cancel_route(pool))
}

pub fn submit_route(pool: WorkerPool) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  warp::path("submit")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::content_length_limit(MAX_BODY_BYTES))
    .and(warp::body::json())
    .and(with_pool(pool))
    .and_then(handle_submit_task)
}

fn list_route(pool: WorkerPool) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  warp::path("tasks")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_pool(pool))
    .and_then(|pool: WorkerPool| async move {
      let tasks = pool.get_all_task_statuses().await.map_err(reject)?;
      Ok::<_, warp::Rejection>(warp::reply::json(&tasks))
    })
}

fn status_route(pool: WorkerPool) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  warp::path!("tasks" / Uuid)
    .and(warp::get())
    .and(with_pool(pool))
    .and_then(|task_id: Uuid, pool: WorkerPool| async move {
      match pool.get_task_status(task_id).await.map_err(reject)? {
        Some(task) => Ok::<_, warp::Rejection>(warp::reply::json(&task)),
        None => Err(reject(ApiError::not_found(format!("task {task_id} is not active")))),
      }
    })
}

fn cancel_route(pool: WorkerPool) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  warp::path!("tasks" / Uuid)
    .and(warp::delete())
    .and(with_pool(pool))
    .and_then(|task_id: Uuid, pool: WorkerPool| async move {
      let outcome = pool.cancel(task_id).await.map_err(reject)?;
      let response = CancelResponse { task_id, outcome, cancelled: outcome == CancelOutcome::Cancelled };
      Ok::<_, warp::Rejection>(warp::reply::json(&response))
    })
}

fn failure_status(e: &TaskError) -> TaskStatus {
  match e {
    TaskError::Timeout(_) => TaskStatus::Timeout,
    TaskError::Cancelled => TaskStatus::Cancelled,
    _ => TaskStatus::Failed,
  }
}

async fn handle_submit_task(new_task: NewTask, pool: WorkerPool) -> Result<impl warp::Reply, warp::Rejection> {
  let options = new_task.options();
  let task_type = new_task.task_type;
  let handle = match pool.submit(task_type, new_task.payload, options).await {
    Ok(handle) => handle,
    Err(e) => {
      error!("Task submission rejected: {}", e);
      let status = match e {
        SubmitError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
        SubmitError::NotRunning | SubmitError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
      };
      let response = TaskResponse { task_id: None, status: TaskStatus::Failed, result: None, error: Some(e.to_string()) };
      return Ok(warp::reply::with_status(warp::reply::json(&response), status));
    }
  };

  let task_id = handle.id();
  info!("Task {} ({}) submitted", task_id, task_type);
  let response = match handle.outcome().await {
    Ok(value) => TaskResponse {
      task_id: Some(task_id),
      status: TaskStatus::Completed,
      result: Some(value),
      error: None,
    },
    Err(e) => TaskResponse {
      task_id: Some(task_id),
      status: failure_status(&e),
      result: None,
      error: Some(e.to_string()),
    },
  };
  Ok(warp::reply::with_status(warp::reply::json(&response), StatusCode::OK))
}
