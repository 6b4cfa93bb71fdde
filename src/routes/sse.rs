use std::convert::Infallible;
use std::time::Duration;

use futures::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::warn;
use warp::Filter;
use warp::sse::Event;

use super::with_pool;
use crate::pool::WorkerPool;

const STATS_INTERVAL: Duration = Duration::from_secs(2);

/// Streams pool stats every two seconds until the client disconnects or the
/// pool goes away.
pub fn sse_route(pool: WorkerPool) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_pool(pool))
    .map(|pool: WorkerPool| {
      let interval = IntervalStream::new(tokio::time::interval(STATS_INTERVAL));
      let stream = interval
        .then(move |_| {
          let pool = pool.clone();
          async move { pool.stats().await }
        })
        .take_while(|stats| futures::future::ready(stats.is_ok()))
        .filter_map(|stats| async move {
          let stats = stats.ok()?;
          match serde_json::to_string(&stats) {
            Ok(data) => Some(Ok::<_, Infallible>(Event::default().event("stats").data(data))),
            Err(e) => {
              warn!("Failed to encode pool stats: {}", e);
              None
            }
          }
        });
      warp::sse::reply(warp::sse::keep_alive().stream(stream))
    })
}
