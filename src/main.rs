use std::sync::Arc;

use anyhow::Result;
use bridge_pool::worker_processing::MetricsCollectionHandler;
use bridge_pool::{Config, HandlerTable, TaskType, WorkerPool, routes::routes};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;

  let handlers = HandlerTable::new().with(TaskType::MetricsCollection, Arc::new(MetricsCollectionHandler::new()));
  let pool = WorkerPool::new(config.pool.clone(), handlers);
  pool.start().await?;
  info!("Worker pool started with {} to {} workers", config.pool.min_workers, config.pool.max_workers);

  let shutdown_pool = pool.clone();
  let (addr, server) = warp::serve(routes(pool)).bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), async move {
    if let Err(e) = tokio::signal::ctrl_c().await {
      error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested, stopping worker pool");
    if let Err(e) = shutdown_pool.stop().await {
      error!("Worker pool did not stop cleanly: {}", e);
    }
  });
  info!("Listening on {}", addr);
  server.await;
  Ok(())
}
