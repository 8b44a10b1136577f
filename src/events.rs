//! Container lifecycle events

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// What happened to a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Started,
    Stopped,
    Removed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Created => write!(f, "created"),
            EventKind::Started => write!(f, "started"),
            EventKind::Stopped => write!(f, "stopped"),
            EventKind::Removed => write!(f, "removed"),
        }
    }
}

/// A lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerEvent {
    pub id: String,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

/// Broadcasts lifecycle events to every subscriber
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ContainerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Publish an event; dropped when nobody is listening
    pub fn publish(&self, id: &str, kind: EventKind) {
        let _ = self.sender.send(ContainerEvent {
            id: id.to_string(),
            kind,
            at: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
