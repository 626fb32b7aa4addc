//! Cache layer that owns the lifecycle of the versioned cache store.

use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::storage::{CacheStorage, CachedResponse};
use crate::http::cache::RequestKey;
use crate::http::client::{fetch_within, Network};
use crate::http::types::{Request, Response};

/// Outcome of seeding the cache at install time.
#[derive(Debug, Default)]
pub struct SeedReport {
  /// URLs that were fetched and stored
  pub cached: Vec<String>,
  /// URLs that could not be stored, with the reason
  pub failed: Vec<(String, String)>,
}

/// Cache layer that manages exactly one live, versioned cache store.
///
/// The version name is fixed at construction; every other store in the
/// backend is stale and removed by [`CacheLayer::reconcile`].
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  version: String,
  vary_headers: Vec<String>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer for the given storage backend and version.
  pub fn new(storage: S, version: impl Into<String>) -> Self {
    Self {
      storage: Arc::new(storage),
      version: version.into(),
      vary_headers: Vec::new(),
    }
  }

  /// Set the request headers that take part in the request identity.
  pub fn with_vary_headers(mut self, vary_headers: Vec<String>) -> Self {
    self.vary_headers = vary_headers;
    self
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  fn key(&self, request: &Request) -> RequestKey {
    RequestKey::from_request(request, &self.vary_headers)
  }

  /// Create the current store and fill it with the seed resources.
  ///
  /// Seeds are fetched concurrently, each bounded by `timeout`, and each is
  /// stored as soon as its fetch succeeds. A seed that fails to fetch, times
  /// out, answers with a non-2xx status, or fails to store is logged and
  /// skipped. Only failing to open the store is an error.
  pub async fn initialize(
    &self,
    seeds: &[Request],
    network: &dyn Network,
    timeout: Option<Duration>,
  ) -> Result<SeedReport> {
    self
      .storage
      .open(&self.version)
      .wrap_err_with(|| format!("Failed to open cache {}", self.version))?;

    let seeding = seeds.iter().map(|request| async move {
      let result = fetch_within(network, request, timeout)
        .await
        .and_then(|response| {
          if response.is_ok() {
            Ok(response)
          } else {
            Err(eyre!("Unexpected status {}", response.status))
          }
        })
        .and_then(|response| self.write(request, response));

      match &result {
        Ok(()) => debug!(url = %request.url, "Cached seed resource"),
        Err(e) => warn!(url = %request.url, error = %e, "Failed to cache seed resource"),
      }
      (request, result)
    });

    let mut report = SeedReport::default();
    for (request, result) in futures::future::join_all(seeding).await {
      match result {
        Ok(()) => report.cached.push(request.url.clone()),
        Err(e) => report.failed.push((request.url.clone(), e.to_string())),
      }
    }

    info!(
      version = %self.version,
      cached = report.cached.len(),
      failed = report.failed.len(),
      "Cache initialized"
    );

    Ok(report)
  }

  /// Delete every store except the current one. Returns the deleted names.
  pub fn reconcile(&self) -> Result<Vec<String>> {
    let names = self.storage.keys().wrap_err("Failed to list caches")?;

    let mut deleted = Vec::new();
    for name in names.into_iter().filter(|name| *name != self.version) {
      info!(cache = %name, "Clearing old cache");
      self
        .storage
        .delete(&name)
        .wrap_err_with(|| format!("Failed to delete cache {}", name))?;
      deleted.push(name);
    }

    Ok(deleted)
  }

  /// Look up the stored response for a request in the current store.
  pub fn read(&self, request: &Request) -> Result<Option<CachedResponse>> {
    self.storage.match_entry(&self.version, &self.key(request))
  }

  /// Store a response for a request in the current store.
  ///
  /// Takes the response by value: callers hand over their own copy.
  pub fn write(&self, request: &Request, response: Response) -> Result<()> {
    self.storage.put(&self.version, &self.key(request), &response)
  }

  /// Names of all stores in the backend.
  pub fn keys(&self) -> Result<Vec<String>> {
    self.storage.keys()
  }

  /// All entries of the current store.
  pub fn entries(&self) -> Result<Vec<CachedResponse>> {
    self.storage.entries(&self.version)
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      version: self.version.clone(),
      vary_headers: self.vary_headers.clone(),
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::http::client::fake::FakeNetwork;

  /// Storage whose every operation fails.
  pub(crate) struct BrokenStorage;

  impl CacheStorage for BrokenStorage {
    fn open(&self, name: &str) -> Result<()> {
      Err(eyre!("Failed to open cache {}: disk full", name))
    }

    fn keys(&self) -> Result<Vec<String>> {
      Err(eyre!("Failed to list caches: disk full"))
    }

    fn delete(&self, name: &str) -> Result<bool> {
      Err(eyre!("Failed to delete cache {}: disk full", name))
    }

    fn match_entry(&self, name: &str, _key: &RequestKey) -> Result<Option<CachedResponse>> {
      Err(eyre!("Failed to read cache {}: disk full", name))
    }

    fn put(&self, name: &str, _key: &RequestKey, _response: &Response) -> Result<()> {
      Err(eyre!("Failed to write cache {}: disk full", name))
    }

    fn entries(&self, name: &str) -> Result<Vec<CachedResponse>> {
      Err(eyre!("Failed to read cache {}: disk full", name))
    }
  }

  fn layer(version: &str) -> CacheLayer<SqliteStorage> {
    CacheLayer::new(SqliteStorage::open_in_memory().unwrap(), version)
  }

  #[tokio::test]
  async fn test_initialize_keeps_reachable_seeds() {
    let network = FakeNetwork::new()
      .respond("http://localhost/A.html", Response::new(200, b"<html>".to_vec()))
      .fail("http://localhost/B.css", "connection refused");
    let cache = layer("v1");
    let seeds = vec![
      Request::get("http://localhost/A.html"),
      Request::get("http://localhost/B.css"),
    ];

    let report = cache.initialize(&seeds, &network, None).await.unwrap();

    assert_eq!(report.cached, vec!["http://localhost/A.html"]);
    assert_eq!(report.failed.len(), 1);
    assert!(cache.read(&seeds[0]).unwrap().is_some());
    assert!(cache.read(&seeds[1]).unwrap().is_none());
    assert_eq!(cache.keys().unwrap(), vec!["v1"]);
  }

  #[tokio::test]
  async fn test_initialize_skips_hung_seed_after_timeout() {
    let network = FakeNetwork::new()
      .respond("http://localhost/A.html", Response::new(200, b"<html>".to_vec()))
      .hang("http://localhost/B.css");
    let cache = layer("v1");
    let seeds = vec![
      Request::get("http://localhost/A.html"),
      Request::get("http://localhost/B.css"),
    ];

    let report = tokio::time::timeout(
      Duration::from_secs(2),
      cache.initialize(&seeds, &network, Some(Duration::from_millis(50))),
    )
    .await
    .expect("install should not wait on a hung seed")
    .unwrap();

    assert_eq!(report.cached, vec!["http://localhost/A.html"]);
    assert!(report.failed[0].1.contains("timed out"));
    assert!(cache.read(&seeds[0]).unwrap().is_some());
    assert!(cache.read(&seeds[1]).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_reachable_seed_is_stored_while_another_is_pending() {
    let network = FakeNetwork::new()
      .respond("http://localhost/A.html", Response::new(200, b"<html>".to_vec()))
      .hang("http://localhost/B.css");
    let cache = layer("v1");
    let seeds = vec![
      Request::get("http://localhost/A.html"),
      Request::get("http://localhost/B.css"),
    ];

    // Without a timeout the hung seed never resolves; A must land anyway
    let seeding = cache.initialize(&seeds, &network, None);
    let _ = tokio::time::timeout(Duration::from_millis(50), seeding).await;

    assert!(cache.read(&seeds[0]).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_initialize_rejects_error_status() {
    let network =
      FakeNetwork::new().respond("http://localhost/gone.js", Response::new(404, Vec::new()));
    let cache = layer("v1");
    let seeds = vec![Request::get("http://localhost/gone.js")];

    let report = cache.initialize(&seeds, &network, None).await.unwrap();

    assert!(report.cached.is_empty());
    assert!(report.failed[0].1.contains("404"));
    assert!(cache.read(&seeds[0]).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_initialize_with_no_reachable_seed_still_creates_store() {
    let network = FakeNetwork::new();
    network.set_online(false);
    let cache = layer("v1");

    let report = cache
      .initialize(&[Request::get("http://localhost/A.html")], &network, None)
      .await
      .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(cache.keys().unwrap(), vec!["v1"]);
  }

  #[tokio::test]
  async fn test_initialize_fails_when_store_cannot_open() {
    let network = FakeNetwork::new();
    let cache = CacheLayer::new(BrokenStorage, "v1");

    assert!(cache.initialize(&[], &network, None).await.is_err());
    assert_eq!(network.calls(), 0);
  }

  #[test]
  fn test_reconcile_keeps_only_current() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("v1").unwrap();
    storage.open("v2").unwrap();
    storage.open("other").unwrap();
    let cache = CacheLayer::new(storage, "v2");

    let deleted = cache.reconcile().unwrap();

    assert_eq!(deleted, vec!["v1", "other"]);
    assert_eq!(cache.keys().unwrap(), vec!["v2"]);
  }

  #[test]
  fn test_reconcile_without_current_store_leaves_nothing_stale() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("v1").unwrap();
    let cache = CacheLayer::new(storage, "v2");

    cache.reconcile().unwrap();

    assert!(cache.keys().unwrap().is_empty());
  }

  #[test]
  fn test_reconcile_surfaces_enumeration_failure() {
    let cache = CacheLayer::new(BrokenStorage, "v1");
    assert!(cache.reconcile().is_err());
  }

  #[test]
  fn test_write_is_last_write_wins() {
    let cache = layer("v1");
    let request = Request::get("http://localhost/data");

    cache.write(&request, Response::new(200, b"first".to_vec())).unwrap();
    cache.write(&request, Response::new(200, b"second".to_vec())).unwrap();

    let cached = cache.read(&request).unwrap().unwrap();
    assert_eq!(cached.response.body, b"second");
    assert_eq!(cache.entries().unwrap().len(), 1);
  }

  #[test]
  fn test_read_uses_vary_headers() {
    let cache = layer("v1").with_vary_headers(vec!["accept".to_string()]);
    let html = Request::get("http://localhost/data").with_header("Accept", "text/html");
    let json = Request::get("http://localhost/data").with_header("Accept", "application/json");

    cache.write(&html, Response::new(200, b"<p>".to_vec())).unwrap();

    assert!(cache.read(&html).unwrap().is_some());
    assert!(cache.read(&json).unwrap().is_none());
  }
}
