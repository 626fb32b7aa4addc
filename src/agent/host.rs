//! The host side of the agent: page clients, notifications and the
//! registration lifecycle.

use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::messages::OutboundMessage;
use super::notification::Notification;
use crate::event::EventDispatcher;

/// Services the agent asks of its host.
pub trait Host: Send + Sync {
  /// Let the installing or waiting generation activate without waiting
  /// for existing clients to close.
  fn skip_waiting(&self) -> BoxFuture<'_, Result<()>>;

  /// Take control of every open client.
  fn claim_clients(&self) -> BoxFuture<'_, Result<()>>;

  /// Post a message to every controlled client. Returns how many received it.
  fn post_to_clients(&self, message: OutboundMessage) -> BoxFuture<'_, Result<usize>>;

  fn show_notification(&self, notification: Notification) -> BoxFuture<'_, Result<()>>;

  fn close_notification(&self, tag: Option<String>) -> BoxFuture<'_, Result<()>>;

  /// Focus an open client showing `url`. Returns false when there is none.
  fn focus_client<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<bool>>;

  fn open_window(&self, url: String) -> BoxFuture<'_, Result<()>>;
}

// ============================================================================
// Registration
// ============================================================================

/// Lifecycle state of one agent generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  Installed,
  Activating,
  Activated,
  Redundant,
}

/// One deployed version of the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  pub id: u64,
  pub version: String,
  pub state: WorkerState,
}

/// Installing, waiting and active generations of the agent.
#[derive(Debug, Clone, Default)]
pub struct Registration {
  pub installing: Option<Generation>,
  pub waiting: Option<Generation>,
  pub active: Option<Generation>,
  /// Generations replaced by newer ones or failed installs
  pub retired: Vec<Generation>,
  skip_waiting: bool,
  next_id: u64,
}

impl Registration {
  /// Start installing a new generation. Any earlier installing one is dropped.
  pub fn begin_install(&mut self, version: &str) -> u64 {
    self.next_id += 1;
    self.skip_waiting = false;
    self.installing = Some(Generation {
      id: self.next_id,
      version: version.to_string(),
      state: WorkerState::Installing,
    });
    self.next_id
  }

  /// The installing generation finished installing and now waits.
  /// A previously waiting generation becomes redundant.
  pub fn install_succeeded(&mut self) -> Option<u64> {
    let mut generation = self.installing.take()?;
    generation.state = WorkerState::Installed;
    let id = generation.id;
    if let Some(old) = self.waiting.replace(generation) {
      self.retire(old);
    }
    Some(id)
  }

  pub fn install_failed(&mut self) {
    if let Some(failed) = self.installing.take() {
      self.retire(failed);
    }
    self.skip_waiting = false;
  }

  fn retire(&mut self, mut generation: Generation) {
    generation.state = WorkerState::Redundant;
    self.retired.push(generation);
  }

  /// Only an installing or waiting generation can skip waiting.
  pub fn request_skip_waiting(&mut self) {
    if self.installing.is_some() || self.waiting.is_some() {
      self.skip_waiting = true;
    }
  }

  /// Move the waiting generation to active when nothing holds it back.
  ///
  /// It is held back while clients are controlled by the current active
  /// generation, unless skip waiting was requested.
  pub fn promote(&mut self, controlled_clients: usize) -> Option<Generation> {
    self.waiting.as_ref()?;
    let blocked = self.active.is_some() && controlled_clients > 0 && !self.skip_waiting;
    if blocked {
      return None;
    }

    let mut generation = self.waiting.take()?;
    generation.state = WorkerState::Activating;
    self.skip_waiting = false;
    if let Some(old) = self.active.replace(generation.clone()) {
      self.retire(old);
    }
    Some(generation)
  }

  pub fn activation_finished(&mut self, id: u64) {
    if let Some(active) = self.active.as_mut().filter(|g| g.id == id) {
      active.state = WorkerState::Activated;
    }
  }
}

// ============================================================================
// Local host
// ============================================================================

/// A connected page.
#[derive(Debug)]
pub struct ClientHandle {
  pub id: u64,
  pub messages: mpsc::UnboundedReceiver<OutboundMessage>,
}

struct Client {
  id: u64,
  url: String,
  controlled: bool,
  tx: mpsc::UnboundedSender<OutboundMessage>,
}

/// In-process host.
///
/// Keeps clients, notifications and the registration in memory and
/// delivers lifecycle events through an attached [`EventDispatcher`].
pub struct LocalHost {
  registration: Mutex<Registration>,
  clients: Mutex<Vec<Client>>,
  notifications: Mutex<Vec<Notification>>,
  windows: Mutex<Vec<String>>,
  focused: Mutex<Vec<u64>>,
  events: Mutex<Option<EventDispatcher>>,
  next_client: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
  mutex.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
}

impl LocalHost {
  pub fn new() -> Self {
    Self {
      registration: Mutex::new(Registration::default()),
      clients: Mutex::new(Vec::new()),
      notifications: Mutex::new(Vec::new()),
      windows: Mutex::new(Vec::new()),
      focused: Mutex::new(Vec::new()),
      events: Mutex::new(None),
      next_client: AtomicU64::new(1),
    }
  }

  /// Deliver lifecycle events to the agent behind `dispatcher`.
  pub fn attach(&self, dispatcher: EventDispatcher) -> Result<()> {
    *lock(&self.events)? = Some(dispatcher);
    Ok(())
  }

  fn dispatcher(&self) -> Result<EventDispatcher> {
    lock(&self.events)?
      .clone()
      .ok_or_else(|| eyre!("No agent attached to host"))
  }

  /// Install `version` and activate it when possible.
  ///
  /// Install completes before activation is considered. A failed install
  /// leaves the registration untouched apart from dropping the attempt.
  /// A failed activate step is returned, but the generation stays active.
  pub async fn register(&self, version: &str) -> Result<()> {
    let dispatcher = self.dispatcher()?;
    let id = lock(&self.registration)?.begin_install(version);
    info!(version, generation = id, "Installing");

    if let Err(e) = dispatcher.install().await {
      lock(&self.registration)?.install_failed();
      return Err(e.wrap_err(format!("Install of {} failed", version)));
    }

    lock(&self.registration)?.install_succeeded();
    if !self.try_activate().await? {
      info!(version, "Installed, waiting for clients to close");
    }

    Ok(())
  }

  /// Activate the waiting generation if nothing holds it back.
  ///
  /// Returns whether a generation was promoted. A failed activate step does
  /// not roll back the promotion and is returned as an error.
  async fn try_activate(&self) -> Result<bool> {
    let promoted = {
      let controlled = self.controlled_clients()?;
      lock(&self.registration)?.promote(controlled)
    };

    let Some(generation) = promoted else {
      return Ok(false);
    };

    info!(version = %generation.version, generation = generation.id, "Activating");
    let outcome = self.dispatcher()?.activate().await;
    lock(&self.registration)?.activation_finished(generation.id);
    outcome.wrap_err_with(|| format!("Activate of {} failed", generation.version))?;

    Ok(true)
  }

  /// Connect a page. It is controlled when a generation is already active.
  pub fn connect(&self, url: impl Into<String>) -> Result<ClientHandle> {
    let controlled = lock(&self.registration)?.active.is_some();
    let id = self.next_client.fetch_add(1, Ordering::SeqCst);
    let (tx, messages) = mpsc::unbounded_channel();

    lock(&self.clients)?.push(Client {
      id,
      url: url.into(),
      controlled,
      tx,
    });

    Ok(ClientHandle { id, messages })
  }

  /// Close a page; a waiting generation may activate once no page is controlled.
  pub async fn disconnect(&self, id: u64) -> Result<()> {
    lock(&self.clients)?.retain(|c| c.id != id);
    self.try_activate().await?;
    Ok(())
  }

  pub fn registration(&self) -> Result<Registration> {
    Ok(lock(&self.registration)?.clone())
  }

  pub fn notifications(&self) -> Result<Vec<Notification>> {
    Ok(lock(&self.notifications)?.clone())
  }

  pub fn opened_windows(&self) -> Result<Vec<String>> {
    Ok(lock(&self.windows)?.clone())
  }

  pub fn focused_clients(&self) -> Result<Vec<u64>> {
    Ok(lock(&self.focused)?.clone())
  }

  pub fn controlled_clients(&self) -> Result<usize> {
    Ok(lock(&self.clients)?.iter().filter(|c| c.controlled).count())
  }
}

impl Default for LocalHost {
  fn default() -> Self {
    Self::new()
  }
}

impl Host for LocalHost {
  fn skip_waiting(&self) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
      let installing = {
        let mut registration = lock(&self.registration)?;
        registration.request_skip_waiting();
        registration.installing.is_some()
      };
      // An installing generation activates once its install completes
      if !installing {
        self.try_activate().await?;
      }
      Ok(())
    })
  }

  fn claim_clients(&self) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
      let mut clients = lock(&self.clients)?;
      for client in clients.iter_mut() {
        client.controlled = true;
      }
      debug!(clients = clients.len(), "Claimed clients");
      Ok(())
    })
  }

  fn post_to_clients(&self, message: OutboundMessage) -> BoxFuture<'_, Result<usize>> {
    Box::pin(async move {
      let mut clients = lock(&self.clients)?;
      // Pages whose receiver is gone are dropped
      clients.retain(|c| !c.tx.is_closed());

      let mut delivered = 0;
      for client in clients.iter().filter(|c| c.controlled) {
        if client.tx.send(message).is_ok() {
          delivered += 1;
        }
      }
      Ok(delivered)
    })
  }

  fn show_notification(&self, notification: Notification) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
      let mut shown = lock(&self.notifications)?;
      // A notification replaces any earlier one with the same tag
      shown.retain(|n| n.tag != notification.tag);
      shown.push(notification);
      Ok(())
    })
  }

  fn close_notification(&self, tag: Option<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
      if let Some(tag) = tag {
        lock(&self.notifications)?.retain(|n| n.tag != tag);
      }
      Ok(())
    })
  }

  fn focus_client<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<bool>> {
    Box::pin(async move {
      let id = lock(&self.clients)?.iter().find(|c| c.url == url).map(|c| c.id);
      match id {
        Some(id) => {
          lock(&self.focused)?.push(id);
          Ok(true)
        }
        None => Ok(false),
      }
    })
  }

  fn open_window(&self, url: String) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
      lock(&self.windows)?.push(url);
      Ok(())
    })
  }
}
