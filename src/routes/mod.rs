use std::convert::Infallible;

use serde_json::json;
use warp::Filter;
use warp::http::StatusCode;

use crate::error::PoolError;
use crate::pool::WorkerPool;

pub mod sse;
pub mod tasks;
pub mod workers;

pub fn routes(pool: WorkerPool) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone {
  tasks::task_routes(pool.clone())
    .or(workers::worker_routes(pool.clone()))
    .or(sse::sse_route(pool))
    .recover(handle_rejection)
}

#[derive(Debug)]
pub struct ApiError {
  pub status: StatusCode,
  pub message: String,
}

impl ApiError {
  pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
    Self { status, message: message.into() }
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self::new(StatusCode::NOT_FOUND, message)
  }
}

impl warp::reject::Reject for ApiError {}

impl From<PoolError> for ApiError {
  fn from(e: PoolError) -> Self {
    Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
  }
}

pub(crate) fn reject(e: impl Into<ApiError>) -> warp::Rejection {
  warp::reject::custom(e.into())
}

pub(crate) fn with_pool(pool: WorkerPool) -> impl Filter<Extract = (WorkerPool,), Error = Infallible> + Clone {
  warp::any().map(move || pool.clone())
}

pub async fn handle_rejection(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
  let (status, message) = if let Some(e) = err.find::<ApiError>() {
    (e.status, e.message.clone())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not found".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
  } else {
    tracing::error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
  };
  Ok(warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status))
}
