//! The offline-support agent: lifecycle, fetch, sync, push and message
//! handlers around one versioned cache store.

pub mod host;
pub mod messages;
pub mod notification;

use color_eyre::{eyre::WrapErr, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::cache::{CacheLayer, CacheResult, CacheStorage, SeedReport};
use crate::config::Config;
use crate::event::{AgentEvent, Spawner, WaitUntil};
use crate::http::client::Network;
use crate::http::interceptor::FetchInterceptor;
use crate::http::types::{Request, Response};

use host::Host;
use messages::{InboundMessage, OutboundMessage};
use notification::Notification;

pub struct Agent<S: CacheStorage> {
  config: Config,
  cache: CacheLayer<S>,
  interceptor: FetchInterceptor<S>,
  network: Arc<dyn Network>,
  host: Arc<dyn Host>,
}

impl<S: CacheStorage + 'static> Agent<S> {
  pub fn new(
    config: Config,
    storage: S,
    network: Arc<dyn Network>,
    host: Arc<dyn Host>,
    spawner: Arc<dyn Spawner>,
  ) -> Self {
    let cache = CacheLayer::new(storage, config.cache.version.clone())
      .with_vary_headers(config.cache.vary_headers.clone());
    let interceptor = FetchInterceptor::new(Arc::clone(&network), cache.clone(), spawner)
      .with_timeout(config.network_timeout());

    Self {
      config,
      cache,
      interceptor,
      network,
      host,
    }
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  /// Handle events until every dispatcher is dropped.
  ///
  /// Each event runs in its own task, so a slow fetch never holds up
  /// other events.
  pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(event) = events.recv().await {
      let agent = Arc::clone(&self);
      tokio::spawn(async move { agent.handle(event).await });
    }
    debug!("Event channel closed, agent stopping");
  }

  pub async fn handle(&self, event: AgentEvent) {
    let name = event.name();
    match event {
      AgentEvent::Install { done } => complete(name, done, self.install().await.map(|_| ())),
      AgentEvent::Activate { done } => complete(name, done, self.activate().await.map(|_| ())),
      AgentEvent::Fetch {
        request,
        respond_with,
      } => {
        // The requester may have gone away; nothing to do then
        let _ = respond_with.send(self.fetch(request).await);
      }
      AgentEvent::Sync { tag, done } => complete(name, done, self.sync(&tag).await),
      AgentEvent::PeriodicSync { tag, done } => {
        complete(name, done, self.periodic_sync(&tag).await)
      }
      AgentEvent::Push { data, done } => complete(name, done, self.push(data.as_deref()).await),
      AgentEvent::NotificationClick { tag, done } => {
        complete(name, done, self.notification_click(tag).await)
      }
      AgentEvent::Message { data, done } => complete(name, done, self.message(&data).await),
    }
  }

  /// Create the current cache and store the seed resources.
  pub async fn install(&self) -> Result<SeedReport> {
    info!(version = %self.cache.version(), "Installing");

    let seeds = self.config.seed_requests()?;
    let report = self
      .cache
      .initialize(&seeds, self.network.as_ref(), self.config.network_timeout())
      .await?;

    if self.config.lifecycle.skip_waiting_on_install {
      self.host.skip_waiting().await?;
    }

    Ok(report)
  }

  /// Drop every stale cache and take control of open pages.
  pub async fn activate(&self) -> Result<Vec<String>> {
    info!(version = %self.cache.version(), "Activating");

    let deleted = self.cache.reconcile()?;
    self.host.claim_clients().await?;

    Ok(deleted)
  }

  pub async fn fetch(&self, request: Request) -> Result<CacheResult<Response>> {
    self.interceptor.handle(request).await
  }

  pub async fn sync(&self, tag: &str) -> Result<()> {
    info!(tag, "Background sync triggered");

    if tag == self.config.sync.location_tag {
      self.relay(OutboundMessage::SyncLocations).await
    } else {
      debug!(tag, "Ignoring unknown sync tag");
      Ok(())
    }
  }

  pub async fn periodic_sync(&self, tag: &str) -> Result<()> {
    info!(tag, "Periodic sync triggered");

    if tag == self.config.sync.periodic_tag {
      self.relay(OutboundMessage::PeriodicUpdate).await
    } else {
      debug!(tag, "Ignoring unknown periodic sync tag");
      Ok(())
    }
  }

  async fn relay(&self, message: OutboundMessage) -> Result<()> {
    let delivered = self
      .host
      .post_to_clients(message)
      .await
      .wrap_err_with(|| format!("Failed to relay {:?} to clients", message))?;

    info!(?message, clients = delivered, "Relayed message to clients");
    Ok(())
  }

  pub async fn push(&self, data: Option<&str>) -> Result<()> {
    info!("Push notification received");

    let notification = Notification::from_push(&self.config.notifications, data);
    self.host.show_notification(notification).await
  }

  /// Close the clicked notification and bring the tracker page up.
  pub async fn notification_click(&self, tag: Option<String>) -> Result<()> {
    info!("Notification clicked");
    self.host.close_notification(tag).await?;

    let url = self.config.resolve(&self.config.notifications.open_url)?;
    if !self.host.focus_client(&url).await? {
      self.host.open_window(url).await?;
    }

    Ok(())
  }

  pub async fn message(&self, data: &Value) -> Result<()> {
    match InboundMessage::parse(data) {
      Some(InboundMessage::SkipWaiting) => {
        info!("Skip waiting requested by client");
        self.host.skip_waiting().await
      }
      Some(InboundMessage::StartTracking) => {
        info!("Tracking started from client");
        Ok(())
      }
      Some(InboundMessage::StopTracking) => {
        info!("Tracking stopped from client");
        Ok(())
      }
      None => {
        debug!(%data, "Ignoring unrecognized message");
        Ok(())
      }
    }
  }
}

/// Resolve a lifecycle event's completion signal, logging failures.
fn complete(event: &'static str, done: WaitUntil, result: Result<()>) {
  if let Err(e) = &result {
    error!(event, error = %e, "Event handler failed");
  }
  let _ = done.send(result);
}
