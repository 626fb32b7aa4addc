//! Request identity for cache lookups.

use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use url::Url;

use super::types::{Request, Response};

/// Key addressing one entry in a cache store.
///
/// Built from method, URL without fragment, and the values of the
/// configured relevant headers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestKey {
  method: String,
  url: String,
  vary: Vec<(String, String)>,
}

impl RequestKey {
  pub fn from_request(request: &Request, vary_headers: &[String]) -> Self {
    let vary = vary_headers
      .iter()
      .map(|name| {
        let name = name.to_lowercase();
        let value = request.header(&name).unwrap_or_default().trim().to_string();
        (name, value)
      })
      .collect();

    Self {
      method: request.method.to_uppercase(),
      url: normalize_url(&request.url),
      vary,
    }
  }

  /// Stable, fixed-length hash used as the storage key.
  pub fn cache_hash(&self) -> String {
    let mut input = format!("{} {}", self.method, self.url);
    for (name, value) in &self.vary {
      input.push('\n');
      input.push_str(name);
      input.push(':');
      input.push_str(value);
    }

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn description(&self) -> String {
    format!("{} {}", self.method, self.url)
  }
}

/// Whether a fetched response may be written to the cache.
///
/// Only GET requests are stored, and partial content never is.
pub fn is_cacheable(request: &Request, response: &Response) -> bool {
  request.is_get() && response.status != 206
}

/// Resolve a resource locator against the page origin.
///
/// Absolute URLs pass through untouched; relative ones such as
/// `./tracker.html` are joined onto `origin`.
pub fn resolve_url(origin: &str, locator: &str) -> Result<String> {
  if let Ok(url) = Url::parse(locator) {
    return Ok(url.to_string());
  }

  let base = Url::parse(origin).map_err(|e| eyre!("Invalid origin {}: {}", origin, e))?;
  let url = base
    .join(locator)
    .map_err(|e| eyre!("Failed to resolve {} against {}: {}", locator, origin, e))?;

  Ok(url.to_string())
}

/// Drop the fragment; unparseable URLs are kept verbatim.
fn normalize_url(url: &str) -> String {
  match Url::parse(url) {
    Ok(mut parsed) => {
      parsed.set_fragment(None);
      parsed.to_string()
    }
    Err(_) => url.to_string(),
  }
}
