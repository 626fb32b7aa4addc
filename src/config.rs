use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::http::cache::resolve_url;
use crate::http::types::Request;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Page origin that relative resource locators resolve against
  pub origin: String,
  pub cache: CacheConfig,
  pub network: NetworkConfig,
  pub notifications: NotificationConfig,
  pub sync: SyncConfig,
  pub lifecycle: LifecycleConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Name of the current cache generation. Bump it whenever seed contents change.
  pub version: String,
  /// Resources stored at install time
  pub seed_resources: Vec<String>,
  /// Database file (defaults to the user data directory)
  pub path: Option<PathBuf>,
  /// Request headers that take part in the cache key
  #[serde(deserialize_with = "deserialize_lowercase")]
  pub vary_headers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Give up on the network after this many milliseconds (null = wait forever)
  pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  /// Body used when a push carries no payload
  pub default_body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub tag: String,
  pub require_interaction: bool,
  /// Page focused or opened when a notification is clicked
  pub open_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Background sync tag that relays queued location updates
  pub location_tag: String,
  /// Periodic sync tag that asks pages for a fresh position
  pub periodic_tag: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
  /// Activate a freshly installed version without waiting for open pages to close
  pub skip_waiting_on_install: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

fn deserialize_lowercase<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080/".to_string(),
      cache: CacheConfig::default(),
      network: NetworkConfig::default(),
      notifications: NotificationConfig::default(),
      sync: SyncConfig::default(),
      lifecycle: LifecycleConfig::default(),
      log: LogConfig::default(),
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "gps-tracker-v2".to_string(),
      seed_resources: vec![
        "./tracker.html".to_string(),
        "./dashboard.html".to_string(),
        "https://unpkg.com/leaflet@1.9.4/dist/leaflet.css".to_string(),
        "https://unpkg.com/leaflet@1.9.4/dist/leaflet.js".to_string(),
      ],
      path: None,
      vary_headers: Vec::new(),
    }
  }
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_ms: Some(10_000),
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "GPS Tracker".to_string(),
      default_body: "GPS Tracking Active".to_string(),
      icon: "./icon-192.png".to_string(),
      badge: "./badge-72.png".to_string(),
      vibrate: vec![200, 100, 200],
      tag: "gps-tracking".to_string(),
      require_interaction: false,
      open_url: "./tracker.html".to_string(),
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      location_tag: "sync-location".to_string(),
      periodic_tag: "location-sync".to_string(),
    }
  }
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self {
      skip_waiting_on_install: true,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tracker-agent.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tracker-agent/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tracker-agent.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tracker-agent").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    if config.cache.version.trim().is_empty() {
      return Err(eyre!("Config file {}: cache.version must not be empty", path.display()));
    }

    Ok(config)
  }

  /// Seed resources as GET requests with absolute URLs.
  pub fn seed_requests(&self) -> Result<Vec<Request>> {
    self
      .cache
      .seed_resources
      .iter()
      .map(|locator| resolve_url(&self.origin, locator).map(Request::get))
      .collect()
  }

  /// Resolve a locator (absolute or relative to the origin).
  pub fn resolve(&self, locator: &str) -> Result<String> {
    resolve_url(&self.origin, locator)
  }

  pub fn network_timeout(&self) -> Option<Duration> {
    self.network.timeout_ms.map(Duration::from_millis)
  }
}
