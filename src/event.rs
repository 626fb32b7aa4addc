use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::CacheResult;
use crate::http::types::{Request, Response};

/// Completion signal for a lifecycle event.
///
/// The host treats the event as unfinished until this is resolved.
pub type WaitUntil = oneshot::Sender<Result<()>>;

/// Response slot for an intercepted fetch.
pub type RespondWith = oneshot::Sender<Result<CacheResult<Response>>>;

/// Events delivered by the host to the agent
#[derive(Debug)]
pub enum AgentEvent {
  Install { done: WaitUntil },
  Activate { done: WaitUntil },
  Fetch { request: Request, respond_with: RespondWith },
  Sync { tag: String, done: WaitUntil },
  PeriodicSync { tag: String, done: WaitUntil },
  Push { data: Option<String>, done: WaitUntil },
  NotificationClick { tag: Option<String>, done: WaitUntil },
  Message { data: Value, done: WaitUntil },
}

impl AgentEvent {
  pub fn name(&self) -> &'static str {
    match self {
      AgentEvent::Install { .. } => "install",
      AgentEvent::Activate { .. } => "activate",
      AgentEvent::Fetch { .. } => "fetch",
      AgentEvent::Sync { .. } => "sync",
      AgentEvent::PeriodicSync { .. } => "periodicsync",
      AgentEvent::Push { .. } => "push",
      AgentEvent::NotificationClick { .. } => "notificationclick",
      AgentEvent::Message { .. } => "message",
    }
  }
}

/// Runs work the caller does not wait for.
pub trait Spawner: Send + Sync {
  /// Start `task` in the background. Its outcome is only logged.
  fn spawn_detached(&self, label: &'static str, task: BoxFuture<'static, Result<()>>);
}

/// Spawner backed by the tokio runtime.
///
/// Tasks keep running when the spawner is dropped. Handles of unfinished
/// tasks are kept so a short-lived process can wait for them with
/// [`TokioSpawner::drain`] before exiting.
#[derive(Debug, Clone, Default)]
pub struct TokioSpawner {
  tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TokioSpawner {
  /// Wait for every detached task spawned so far.
  pub async fn drain(&self) {
    let tasks = match self.tasks.lock() {
      Ok(mut tasks) => std::mem::take(&mut *tasks),
      Err(e) => {
        warn!(error = %e, "Lock poisoned, not waiting for detached tasks");
        return;
      }
    };
    for task in tasks {
      if let Err(e) = task.await {
        warn!(error = %e, "Detached task panicked");
      }
    }
  }
}

impl Spawner for TokioSpawner {
  fn spawn_detached(&self, label: &'static str, task: BoxFuture<'static, Result<()>>) {
    let task = async move {
      match task.await {
        Ok(()) => debug!(task = label, "Detached task finished"),
        Err(e) => warn!(task = label, error = %e, "Detached task failed"),
      }
    };

    let handle = tokio::spawn(task);
    if let Ok(mut tasks) = self.tasks.lock() {
      tasks.retain(|t| !t.is_finished());
      tasks.push(handle);
    }
  }
}

/// Host-side handle for delivering events to a running agent.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
  tx: mpsc::UnboundedSender<AgentEvent>,
}

impl EventDispatcher {
  /// Create a dispatcher and the receiver the agent's event loop consumes.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }

  fn send(&self, event: AgentEvent) -> Result<()> {
    let name = event.name();
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Agent is not running, cannot deliver {} event", name))
  }

  async fn wait_until(&self, make: impl FnOnce(WaitUntil) -> AgentEvent) -> Result<()> {
    let (done, rx) = oneshot::channel();
    self.send(make(done))?;
    rx.await
      .map_err(|_| eyre!("Agent dropped the event before completing it"))?
  }

  pub async fn install(&self) -> Result<()> {
    self.wait_until(|done| AgentEvent::Install { done }).await
  }

  pub async fn activate(&self) -> Result<()> {
    self.wait_until(|done| AgentEvent::Activate { done }).await
  }

  pub async fn fetch(&self, request: Request) -> Result<CacheResult<Response>> {
    let (respond_with, rx) = oneshot::channel();
    self.send(AgentEvent::Fetch {
      request,
      respond_with,
    })?;
    rx.await
      .map_err(|_| eyre!("Agent dropped the fetch before responding"))?
  }

  pub async fn sync(&self, tag: impl Into<String>) -> Result<()> {
    let tag = tag.into();
    self.wait_until(|done| AgentEvent::Sync { tag, done }).await
  }

  pub async fn periodic_sync(&self, tag: impl Into<String>) -> Result<()> {
    let tag = tag.into();
    self
      .wait_until(|done| AgentEvent::PeriodicSync { tag, done })
      .await
  }

  pub async fn push(&self, data: Option<String>) -> Result<()> {
    self.wait_until(|done| AgentEvent::Push { data, done }).await
  }

  pub async fn notification_click(&self, tag: Option<String>) -> Result<()> {
    self
      .wait_until(|done| AgentEvent::NotificationClick { tag, done })
      .await
  }

  /// Post a message from a page and wait until the agent has handled it.
  pub async fn message(&self, data: Value) -> Result<()> {
    self.wait_until(|done| AgentEvent::Message { data, done }).await
  }
}
