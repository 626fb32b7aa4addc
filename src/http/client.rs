use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

use super::types::{Request, Response};

/// Anything that can perform a network fetch for an intercepted request.
///
/// A rejected fetch (offline, DNS failure, connection reset) is an `Err`.
/// HTTP error statuses are successful fetches.
pub trait Network: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>>;
}

/// Fetch through `network`, giving up after `timeout` when one is set.
pub async fn fetch_within(
  network: &dyn Network,
  request: &Request,
  timeout: Option<Duration>,
) -> Result<Response> {
  let fetch = network.fetch(request);
  match timeout {
    Some(timeout) => tokio::time::timeout(timeout, fetch)
      .await
      .map_err(|_| eyre!("Fetch of {} timed out after {:?}", request.url, timeout))?,
    None => fetch.await,
  }
}

/// Network backend using reqwest.
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("tracker-agent/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  async fn send(&self, request: &Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, &request.url);
    for (name, value) in &request.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| eyre!("Invalid header name {}: {}", name, e))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| eyre!("Invalid value for header {}: {}", name, e))?;
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = header_pairs(response.headers());

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

/// Every response header as a name/value pair. Values that are not valid
/// UTF-8 are kept with replacement characters rather than dropped.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .map(|(name, value)| {
      (
        name.as_str().to_string(),
        String::from_utf8_lossy(value.as_bytes()).into_owned(),
      )
    })
    .collect()
}

impl Network for HttpClient {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    Box::pin(self.send(request))
  }
}


#[cfg(test)]
mod tests {
  use super::fake::FakeNetwork;
  use super::*;

  #[test]
  fn test_header_pairs_keep_non_utf8_values() {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("text/plain"));
    headers.insert(
      "content-disposition",
      HeaderValue::from_bytes(b"attachment; filename=caf\xe9.gpx").unwrap(),
    );

    let pairs = header_pairs(&headers);

    assert_eq!(pairs.len(), 2);
    let disposition = pairs
      .iter()
      .find(|(name, _)| name == "content-disposition")
      .unwrap();
    assert!(disposition.1.starts_with("attachment; filename=caf"));
    assert!(disposition.1.ends_with(".gpx"));
  }

  #[tokio::test]
  async fn test_fetch_within_gives_up_on_hung_request() {
    let network = FakeNetwork::new().hang("http://localhost/slow");
    let request = Request::get("http://localhost/slow");

    let err = fetch_within(&network, &request, Some(Duration::from_millis(20)))
      .await
      .unwrap_err();

    assert!(err.to_string().contains("timed out"));
  }

  #[tokio::test]
  async fn test_fetch_within_without_timeout_passes_through() {
    let network =
      FakeNetwork::new().respond("http://localhost/ok", Response::new(200, b"ok".to_vec()));

    let response = fetch_within(&network, &Request::get("http://localhost/ok"), None)
      .await
      .unwrap();

    assert_eq!(response.body, b"ok");
  }
}
