//! Message records exchanged with page clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages the agent posts to every controlled page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
  /// Connectivity is back; the page should flush its queued locations
  SyncLocations,
  /// Periodic wake-up; the page should record a fresh position
  PeriodicUpdate,
}

/// Messages pages send to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundMessage {
  SkipWaiting,
  StartTracking,
  StopTracking,
}

impl InboundMessage {
  /// Recognize a message by its `type` field. Anything else is `None`.
  pub fn parse(data: &Value) -> Option<Self> {
    serde_json::from_value(data.clone()).ok()
  }
}
