use crate::entity::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Signals for the presentation layer. State itself is read back from the
/// stores; events only say what changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// Identity was set, replaced or cleared
    SessionChanged,

    /// A new online-peer snapshot was applied
    PresenceChanged,

    /// The peer list or unseen counts were replaced
    PeersRefreshed,

    /// The unseen count of one peer changed
    UnseenChanged { peer: PeerId, count: u32 },

    /// Selection, loading phase or visible messages changed
    ConversationChanged,

    /// The realtime channel dropped or came back
    ConnectionChanged { connected: bool },

    /// A transient user-facing notification
    Notification {
        level: NotificationLevel,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Success,
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        self.publish(Event::Notification {
            level,
            message: message.into(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
