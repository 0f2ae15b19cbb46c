//! Real-time event model and its JSON wire shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Closed set of event types carried over the real-time channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SyncStatusUpdate,
    TestProgress,
    LogAlert,
    AiSuggestionReady,
    Connect,
    Disconnect,
    Heartbeat,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SyncStatusUpdate => "sync_status_update",
            EventType::TestProgress => "test_progress",
            EventType::LogAlert => "log_alert",
            EventType::AiSuggestionReady => "ai_suggestion_ready",
            EventType::Connect => "connect",
            EventType::Disconnect => "disconnect",
            EventType::Heartbeat => "heartbeat",
        }
    }

    /// Types handled by the session itself rather than the application.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            EventType::Connect | EventType::Disconnect | EventType::Heartbeat
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message delivered to clients.
///
/// An empty `client_id` marks a broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub client_id: String,
}

impl Event {
    /// Broadcast event stamped with the current time.
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
            client_id: String::new(),
        }
    }

    /// Event addressed to a single client.
    pub fn for_client(event_type: EventType, data: Value, client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::new(event_type, data)
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.client_id.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
