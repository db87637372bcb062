//! Asynchronous event delivery.
//!
//! Producers (transport callbacks, the send pipeline) publish into one
//! process-wide [`EventQueue`]. A single fan-out pump owned by the
//! [`EventHub`] moves events from the queue into a broadcast channel, and
//! each open connection holds an [`EventSubscription`] on that channel.
//!
//! The queue outlives connections and service restarts. Shutdown drains it;
//! only process teardown closes it.

mod hub;
mod queue;

pub use hub::{EventHub, EventSubscription};
pub use queue::{EventQueue, EventQueueStats, PublishOutcome};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EventConfig;

/// Kind of asynchronous event pushed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Service status, sent once to every new connection.
    Status,
    /// A fresh pairing code is available.
    QrCode,
    Connected,
    Disconnected,
    ConnectionFailure,
    LoggedOut,
    TemporaryBan,
    MessageReceived,
    MessageSent,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Status => "status",
            EventKind::QrCode => "qr_code",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::ConnectionFailure => "connection_failure",
            EventKind::LoggedOut => "logged_out",
            EventKind::TemporaryBan => "temporary_ban",
            EventKind::MessageReceived => "message_received",
            EventKind::MessageSent => "message_sent",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Method name used when the event is sent as a notification.
    pub fn notification_method(&self) -> String {
        format!("{}{}", EventConfig::NOTIFICATION_PREFIX, self.kind)
    }
}
