use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::descriptor::Descriptor;

/// Event key type
pub type EventKey = String;

/// Relay lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEvent {
    /// Event key (e.g., "copy.completed", "tag.applied")
    pub key: EventKey,

    /// Node the event is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<Descriptor>,

    /// Tag, output path or count, depending on the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl RelayEvent {
    /// Create an event about a node
    pub fn node(key: impl Into<String>, descriptor: &Descriptor) -> Self {
        Self {
            key: key.into(),
            descriptor: Some(descriptor.clone()),
            detail: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event with a detail string only
    pub fn with_detail(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            descriptor: None,
            detail: Some(detail.into()),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Attach a detail string
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<RelayEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event. Events without subscribers are dropped.
    pub fn emit(&self, event: RelayEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }
}

/// Event catalog - predefined event keys
pub mod events {
    // Node events
    pub const COPY_STARTED: &str = "copy.started";
    pub const COPY_COMPLETED: &str = "copy.completed";
    pub const COPY_SKIPPED: &str = "copy.skipped";
    pub const COPY_MOUNTED: &str = "copy.mounted";

    // Tag events
    pub const TAG_APPLIED: &str = "tag.applied";

    // Backup events
    pub const BACKUP_TAGS_FOUND: &str = "backup.tags_found";
    pub const BACKUP_ARTIFACT: &str = "backup.artifact";
    pub const BACKUP_EXPORTING: &str = "backup.exporting";
    pub const BACKUP_EXPORTED: &str = "backup.exported";
    pub const BACKUP_COMPLETED: &str = "backup.completed";
}
