//! Network-first fetch with cache fallback.

use color_eyre::{eyre::WrapErr, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::event::Spawner;

use super::cache::is_cacheable;
use super::client::{fetch_within, Network};
use super::types::{Request, Response};

/// Intercepts requests with a network-first policy.
///
/// Live responses are returned as soon as they arrive while a copy is
/// written to the cache in a detached task. When the network fails the
/// last stored copy is served instead; with no stored copy the network
/// error is returned as is.
pub struct FetchInterceptor<S: CacheStorage> {
  network: Arc<dyn Network>,
  cache: CacheLayer<S>,
  spawner: Arc<dyn Spawner>,
  timeout: Option<Duration>,
}

impl<S: CacheStorage + 'static> FetchInterceptor<S> {
  pub fn new(network: Arc<dyn Network>, cache: CacheLayer<S>, spawner: Arc<dyn Spawner>) -> Self {
    Self {
      network,
      cache,
      spawner,
      timeout: None,
    }
  }

  /// Give up on the network after `timeout` and fall back to the cache.
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub async fn handle(&self, request: Request) -> Result<CacheResult<Response>> {
    match fetch_within(self.network.as_ref(), &request, self.timeout).await {
      Ok(response) => {
        if is_cacheable(&request, &response) {
          let copy = response.clone();
          let cache = self.cache.clone();
          let url = request.url.clone();
          self.spawner.spawn_detached(
            "cache-write",
            Box::pin(async move {
              cache
                .write(&request, copy)
                .wrap_err_with(|| format!("Failed to cache response for {}", url))
            }),
          );
        }
        Ok(CacheResult::from_network(response))
      }
      Err(network_err) => {
        debug!(url = %request.url, error = %network_err, "Network failed, trying cache");

        match self.cache.read(&request) {
          Ok(Some(cached)) => Ok(CacheResult::offline(cached.response, cached.cached_at)),
          Ok(None) => Err(network_err.wrap_err(format!("No cached response for {}", request.url))),
          Err(cache_err) => {
            warn!(url = %request.url, error = %cache_err, "Cache lookup failed");
            Err(network_err.wrap_err(format!("No cached response for {}", request.url)))
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{BrokenStorage, CacheSource, SqliteStorage};
  use crate::event::manual::ManualSpawner;
  use crate::event::TokioSpawner;
  use crate::http::client::fake::{FakeNetwork, Route};

  const DATA: &str = "http://localhost/data";

  fn interceptor(
    network: Arc<FakeNetwork>,
    spawner: Arc<ManualSpawner>,
  ) -> (FetchInterceptor<SqliteStorage>, CacheLayer<SqliteStorage>) {
    let cache = CacheLayer::new(SqliteStorage::open_in_memory().unwrap(), "v1");
    let interceptor = FetchInterceptor::new(network, cache.clone(), spawner);
    (interceptor, cache)
  }

  #[tokio::test]
  async fn test_online_response_returned_before_cache_write() {
    let live = Response::new(200, b"{\"lat\":1}".to_vec())
      .with_header("Content-Type", "application/json");
    let network = Arc::new(FakeNetwork::new().respond(DATA, live.clone()));
    let spawner = Arc::new(ManualSpawner::default());
    let (interceptor, cache) = interceptor(network, spawner.clone());

    let result = interceptor.handle(Request::get(DATA)).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data, live);
    // The write is still parked, nothing stored yet
    assert_eq!(spawner.pending(), 1);
    assert!(cache.read(&Request::get(DATA)).unwrap().is_none());

    let results = spawner.run_pending().await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(cache.read(&Request::get(DATA)).unwrap().unwrap().response, live);
  }

  #[tokio::test]
  async fn test_returned_and_stored_values_are_independent() {
    let live = Response::new(200, b"live".to_vec());
    let network = Arc::new(FakeNetwork::new().respond(DATA, live.clone()));
    let spawner = Arc::new(ManualSpawner::default());
    let (interceptor, cache) = interceptor(network, spawner.clone());

    let mut returned = interceptor.handle(Request::get(DATA)).await.unwrap().data;
    returned.body.clear();
    returned.headers.push(("X-Mutated".to_string(), "yes".to_string()));
    spawner.run_pending().await;

    assert_eq!(cache.read(&Request::get(DATA)).unwrap().unwrap().response, live);
  }

  #[tokio::test]
  async fn test_online_then_offline_serves_cached_copy() {
    let live = Response::new(200, b"position".to_vec()).with_header("ETag", "\"1\"");
    let network = Arc::new(FakeNetwork::new().respond(DATA, live.clone()));
    let spawner = Arc::new(ManualSpawner::default());
    let (interceptor, _cache) = interceptor(network.clone(), spawner.clone());

    interceptor.handle(Request::get(DATA)).await.unwrap();
    spawner.run_pending().await;

    network.set_online(false);
    let result = interceptor.handle(Request::get(DATA)).await.unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert!(result.cached_at.is_some());
    assert_eq!(result.data, live);
  }

  #[tokio::test]
  async fn test_offline_miss_propagates_failure() {
    let network = Arc::new(FakeNetwork::new());
    network.set_online(false);
    let spawner = Arc::new(ManualSpawner::default());
    let (interceptor, _cache) = interceptor(network, spawner);

    let err = interceptor.handle(Request::get(DATA)).await.unwrap_err();

    assert!(err.to_string().contains("No cached response"));
  }

  #[tokio::test]
  async fn test_error_status_is_not_a_network_failure() {
    let network = Arc::new(FakeNetwork::new().respond(DATA, Response::new(500, b"oops".to_vec())));
    let spawner = Arc::new(ManualSpawner::default());
    let (interceptor, cache) = interceptor(network, spawner.clone());
    cache.write(&Request::get(DATA), Response::new(200, b"old".to_vec())).unwrap();

    let result = interceptor.handle(Request::get(DATA)).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.status, 500);
  }

  #[tokio::test]
  async fn test_non_get_is_not_cached() {
    let network = Arc::new(FakeNetwork::new().respond(DATA, Response::new(201, Vec::new())));
    let spawner = Arc::new(ManualSpawner::default());
    let (interceptor, _cache) = interceptor(network, spawner.clone());

    let request = Request::get(DATA).with_method("POST");
    interceptor.handle(request).await.unwrap();

    assert_eq!(spawner.pending(), 0);
  }

  #[tokio::test]
  async fn test_timeout_falls_back_to_cache() {
    let network = Arc::new(FakeNetwork::new().hang(DATA));
    let spawner = Arc::new(ManualSpawner::default());
    let (interceptor, cache) = interceptor(network, spawner);
    let interceptor = interceptor.with_timeout(Some(Duration::from_millis(20)));
    cache.write(&Request::get(DATA), Response::new(200, b"cached".to_vec())).unwrap();

    let result = interceptor.handle(Request::get(DATA)).await.unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body, b"cached");
  }

  #[tokio::test]
  async fn test_timeout_without_cache_fails() {
    let network = Arc::new(FakeNetwork::new().hang(DATA));
    let spawner = Arc::new(ManualSpawner::default());
    let (interceptor, _cache) = interceptor(network, spawner);
    let interceptor = interceptor.with_timeout(Some(Duration::from_millis(20)));

    let err = interceptor.handle(Request::get(DATA)).await.unwrap_err();
    assert!(format!("{:?}", err).contains("timed out"));
  }

  #[tokio::test]
  async fn test_broken_cache_does_not_affect_live_response() {
    let network = Arc::new(FakeNetwork::new().respond(DATA, Response::new(200, b"live".to_vec())));
    let spawner = Arc::new(ManualSpawner::default());
    let interceptor = FetchInterceptor::new(
      network.clone(),
      CacheLayer::new(BrokenStorage, "v1"),
      spawner.clone(),
    );

    let result = interceptor.handle(Request::get(DATA)).await.unwrap();
    assert_eq!(result.data.body, b"live");
    assert!(spawner.run_pending().await[0].is_err());

    // Offline with an unreadable store reads as a miss
    network.set(DATA, Route::Fail("offline".to_string()));
    assert!(interceptor.handle(Request::get(DATA)).await.is_err());
  }

  #[tokio::test]
  async fn test_tokio_spawner_eventually_writes() {
    let network = Arc::new(FakeNetwork::new().respond(DATA, Response::new(200, b"live".to_vec())));
    let cache = CacheLayer::new(SqliteStorage::open_in_memory().unwrap(), "v1");
    let spawner = Arc::new(TokioSpawner::default());
    let interceptor = FetchInterceptor::new(network, cache.clone(), spawner);

    interceptor.handle(Request::get(DATA)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(cache.read(&Request::get(DATA)).unwrap().is_some());
  }
}
