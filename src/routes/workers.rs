use serde::{Deserialize, Serialize};
use warp::Filter;

use super::{ApiError, reject, with_pool};
use crate::messaging::WorkerId;
use crate::models::TaskType;
use crate::pool::WorkerPool;

#[derive(Debug, Serialize, Deserialize)]
pub struct AffinityResponse {
  pub worker_id: WorkerId,
  pub affinity: Option<Vec<TaskType>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsRequested {
  pub workers_asked: usize,
}

pub fn worker_routes(pool: WorkerPool) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  let list = warp::path("workers")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_pool(pool.clone()))
    .and_then(|pool: WorkerPool| async move {
      let workers = pool.get_all_worker_statuses().await.map_err(reject)?;
      Ok::<_, warp::Rejection>(warp::reply::json(&workers))
    });

  let stats = warp::path("stats")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_pool(pool.clone()))
    .and_then(|pool: WorkerPool| async move {
      let stats = pool.stats().await.map_err(reject)?;
      Ok::<_, warp::Rejection>(warp::reply::json(&stats))
    });

  list
    .or(stats)
    .or(affinity_routes(pool.clone()))
    .or(metrics_routes(pool))
}

fn affinity_routes(pool: WorkerPool) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  let get = warp::path!("workers" / WorkerId / "affinity")
    .and(warp::get())
    .and(with_pool(pool.clone()))
    .and_then(|worker_id: WorkerId, pool: WorkerPool| async move {
      let affinity = pool.get_worker_affinity(worker_id).await.map_err(reject)?;
      Ok::<_, warp::Rejection>(warp::reply::json(&AffinityResponse { worker_id, affinity }))
    });

  let set = warp::path!("workers" / WorkerId / "affinity")
    .and(warp::put())
    .and(warp::body::content_length_limit(4 * 1024))
    .and(warp::body::json())
    .and(with_pool(pool.clone()))
    .and_then(|worker_id: WorkerId, task_types: Vec<TaskType>, pool: WorkerPool| async move {
      if !pool.set_worker_affinity(worker_id, task_types.clone()).await.map_err(reject)? {
        return Err(reject(ApiError::not_found(format!("worker {worker_id} not found"))));
      }
      let mut affinity = task_types;
      affinity.sort();
      affinity.dedup();
      Ok::<_, warp::Rejection>(warp::reply::json(&AffinityResponse { worker_id, affinity: Some(affinity) }))
    });

  let clear = warp::path!("workers" / WorkerId / "affinity")
    .and(warp::delete())
    .and(with_pool(pool))
    .and_then(|worker_id: WorkerId, pool: WorkerPool| async move {
      if !pool.clear_worker_affinity(worker_id).await.map_err(reject)? {
        return Err(reject(ApiError::not_found(format!("worker {worker_id} not found"))));
      }
      Ok::<_, warp::Rejection>(warp::reply::json(&AffinityResponse { worker_id, affinity: None }))
    });

  get.or(set).or(clear)
}

fn metrics_routes(pool: WorkerPool) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  let all = warp::path!("workers" / "metrics")
    .and(warp::post())
    .and(with_pool(pool.clone()))
    .and_then(|pool: WorkerPool| async move {
      let workers_asked = pool.request_all_worker_metrics().await.map_err(reject)?;
      Ok::<_, warp::Rejection>(warp::reply::json(&MetricsRequested { workers_asked }))
    });

  let one = warp::path!("workers" / WorkerId / "metrics")
    .and(warp::post())
    .and(with_pool(pool))
    .and_then(|worker_id: WorkerId, pool: WorkerPool| async move {
      if !pool.request_worker_metrics(worker_id).await.map_err(reject)? {
        return Err(reject(ApiError::not_found(format!("worker {worker_id} not found"))));
      }
      Ok::<_, warp::Rejection>(warp::reply::json(&MetricsRequested { workers_asked: 1 }))
    });

  all.or(one)
}
