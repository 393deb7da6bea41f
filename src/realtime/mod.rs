//! Realtime channel: push delivery of messages and presence snapshots.
//!
//! A connector opens one channel per identity. Inbound events are pushed
//! into the `mpsc` sender handed to [`RealtimeConnector::connect`]; the
//! returned [`ChannelHandle`] emits outbound events and closes the channel
//! when dropped. Reconnection is the connector's business.

pub mod socketio;

pub use socketio::SocketIoConnector;

use crate::chat::Message;
use crate::entity::PeerId;
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Complete set of online peers, replacing the previous one
    OnlinePeers(Vec<PeerId>),
    /// A message addressed to the current identity
    NewMessage(Message),
    Disconnected,
    Reconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    /// Tells the recipient's clients about a message the server accepted
    MessageSent { to: PeerId, message: Message },
}

pub struct ChannelHandle {
    id: String,
    outbound: mpsc::UnboundedSender<OutboundEvent>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ChannelHandle {
    pub fn new(
        id: impl Into<String>,
        outbound: mpsc::UnboundedSender<OutboundEvent>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id: id.into(),
            outbound,
            shutdown: Some(shutdown),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn emit(&self, event: OutboundEvent) -> Result<()> {
        self.outbound
            .send(event)
            .map_err(|_| ChatError::Realtime(format!("channel {} is closed", self.id)))
    }

    pub fn close(mut self) {
        self.shutdown_now();
    }

    fn shutdown_now(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            debug!("Closing realtime channel {}", self.id);
            let _ = tx.send(());
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle").field("id", &self.id).finish()
    }
}

#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    /// Open a channel keyed by `identity`.
    async fn connect(
        &self,
        identity: &PeerId,
        inbound: mpsc::UnboundedSender<InboundEvent>,
    ) -> Result<ChannelHandle>;
}
