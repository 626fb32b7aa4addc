use serde::Serialize;

use crate::config::NotificationConfig;

/// A notification to display, as handed to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub tag: String,
  pub require_interaction: bool,
}

impl Notification {
  /// Build the notification for a push. The payload text becomes the body.
  pub fn from_push(config: &NotificationConfig, payload: Option<&str>) -> Self {
    Self {
      title: config.title.clone(),
      body: payload.unwrap_or(&config.default_body).to_string(),
      icon: config.icon.clone(),
      badge: config.badge.clone(),
      vibrate: config.vibrate.clone(),
      tag: config.tag.clone(),
      require_interaction: config.require_interaction,
    }
  }
}
