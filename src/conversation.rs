//! Conversation with the selected peer.
//!
//! Visible sequence: the server history as loaded, in server order,
//! followed by realtime and sent messages in arrival order. Nothing is
//! re-sorted by timestamp. Only the selected peer's messages are kept in
//! memory; other peers contribute unseen counts.
//!
//! [`ConversationState`] is the synchronous state machine.
//! [`ConversationStore`] drives it from user intents, collaborator
//! responses and realtime events.

use crate::api::ChatApi;
use crate::bus::{Event, EventBus, NotificationLevel};
use crate::chat::{self, Message, OutgoingMessage};
use crate::config::{HistoryFailurePolicy, RealtimeOrdering};
use crate::directory::Directory;
use crate::entity::{Peer, PeerId};
use crate::error::{ChatError, Result};
use crate::realtime::OutboundEvent;
use crate::session::SessionStore;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    NoPeerSelected,
    LoadingHistory(PeerId),
    Ready(PeerId),
}

/// Identifies one history fetch. A result is applied only while its
/// ticket is still current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub peer: PeerId,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    /// History applied. Carries ids of buffered messages from the peer
    /// that were appended and now need a seen receipt.
    Applied { newly_seen: Vec<String> },
    /// Selection moved on; the result was discarded.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Ready with whatever was buffered. Carries ids of buffered messages
    /// from the peer that now need a seen receipt.
    FellBackToReady { newly_seen: Vec<String> },
    StillLoading,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingOutcome {
    /// Shown in the open conversation; needs a seen receipt.
    Appended,
    /// Held until the history of the selected peer finishes loading.
    Buffered,
    /// Already visible or buffered.
    Duplicate,
    /// From someone other than the selected peer.
    Unseen(PeerId),
}

#[derive(Debug, Clone)]
pub struct ConversationState {
    phase: Phase,
    selected: Option<Peer>,
    messages: Vec<Message>,
    pending: Vec<Message>,
    generation: u64,
    ordering: RealtimeOrdering,
    failure_policy: HistoryFailurePolicy,
}

impl ConversationState {
    pub fn new(ordering: RealtimeOrdering, failure_policy: HistoryFailurePolicy) -> Self {
        Self {
            phase: Phase::NoPeerSelected,
            selected: None,
            messages: Vec::new(),
            pending: Vec::new(),
            generation: 0,
            ordering,
            failure_policy,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn selected(&self) -> Option<&Peer> {
        self.selected.as_ref()
    }

    pub fn selected_id(&self) -> Option<&PeerId> {
        self.selected.as_ref().map(|p| &p.id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Select `peer` from any phase. Always starts a fresh load.
    pub fn select(&mut self, peer: Peer) -> LoadTicket {
        self.generation += 1;
        self.messages.clear();
        self.pending.clear();
        self.phase = Phase::LoadingHistory(peer.id.clone());
        let ticket = LoadTicket {
            peer: peer.id.clone(),
            generation: self.generation,
        };
        self.selected = Some(peer);
        ticket
    }

    pub fn deselect(&mut self) {
        self.generation += 1;
        self.messages.clear();
        self.pending.clear();
        self.phase = Phase::NoPeerSelected;
        self.selected = None;
    }

    pub fn is_current(&self, ticket: &LoadTicket) -> bool {
        ticket.generation == self.generation
            && matches!(&self.phase, Phase::LoadingHistory(peer) if peer == &ticket.peer)
    }

    pub fn apply_history(&mut self, ticket: &LoadTicket, history: Vec<Message>) -> HistoryOutcome {
        if !self.is_current(ticket) {
            return HistoryOutcome::Stale;
        }

        self.messages = history;
        let mut newly_seen = Vec::new();
        for mut message in std::mem::take(&mut self.pending) {
            if self.contains(&message.id) {
                continue;
            }
            if message.is_from(&ticket.peer) && !message.seen {
                message.seen = true;
                newly_seen.push(message.id.clone());
            }
            self.messages.push(message);
        }

        self.phase = Phase::Ready(ticket.peer.clone());
        HistoryOutcome::Applied { newly_seen }
    }

    /// Under `ReadyEmpty` the sequence holds only what arrived while the
    /// fetch was in flight.
    pub fn apply_history_failure(&mut self, ticket: &LoadTicket) -> FailureOutcome {
        if !self.is_current(ticket) {
            return FailureOutcome::Stale;
        }

        match self.failure_policy {
            HistoryFailurePolicy::ReadyEmpty => {
                let mut newly_seen = Vec::new();
                if self.ordering == RealtimeOrdering::Buffered {
                    self.messages = std::mem::take(&mut self.pending);
                    for message in self.messages.iter_mut() {
                        if message.is_from(&ticket.peer) && !message.seen {
                            message.seen = true;
                            newly_seen.push(message.id.clone());
                        }
                    }
                }
                self.phase = Phase::Ready(ticket.peer.clone());
                FailureOutcome::FellBackToReady { newly_seen }
            }
            HistoryFailurePolicy::StayLoading => FailureOutcome::StillLoading,
        }
    }

    pub fn incoming(&mut self, mut message: Message) -> IncomingOutcome {
        let from_selected = self
            .selected_id()
            .is_some_and(|selected| message.is_from(selected));
        if !from_selected {
            return IncomingOutcome::Unseen(message.sender_id);
        }

        let loading = matches!(self.phase, Phase::LoadingHistory(_));
        let ordering = self.ordering;
        match ordering {
            RealtimeOrdering::Buffered if loading => {
                if self.pending.iter().any(|m| m.id == message.id) {
                    return IncomingOutcome::Duplicate;
                }
                self.pending.push(message);
                IncomingOutcome::Buffered
            }
            RealtimeOrdering::Buffered if self.contains(&message.id) => IncomingOutcome::Duplicate,
            _ => {
                message.seen = true;
                self.messages.push(message);
                IncomingOutcome::Appended
            }
        }
    }

    /// Record the server's copy of a message we sent. Returns `false` when
    /// the selection moved to another peer while the send was in flight.
    pub fn record_sent(&mut self, message: Message) -> bool {
        let for_selected = self
            .selected_id()
            .is_some_and(|selected| &message.recipient_id == selected);
        if !for_selected {
            return false;
        }

        let loading = matches!(self.phase, Phase::LoadingHistory(_));
        let ordering = self.ordering;
        match ordering {
            RealtimeOrdering::Buffered if loading => {
                if !self.pending.iter().any(|m| m.id == message.id) {
                    self.pending.push(message);
                }
            }
            RealtimeOrdering::Buffered if self.contains(&message.id) => {}
            _ => self.messages.push(message),
        }
        true
    }

    fn contains(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }
}

pub struct ConversationStore {
    api: Arc<dyn ChatApi>,
    session: Arc<SessionStore>,
    directory: Arc<Directory>,
    bus: Arc<EventBus>,
    state: RwLock<ConversationState>,
}

impl ConversationStore {
    pub fn new(
        api: Arc<dyn ChatApi>,
        session: Arc<SessionStore>,
        directory: Arc<Directory>,
        bus: Arc<EventBus>,
        ordering: RealtimeOrdering,
        failure_policy: HistoryFailurePolicy,
    ) -> Self {
        Self {
            api,
            session,
            directory,
            bus,
            state: RwLock::new(ConversationState::new(ordering, failure_policy)),
        }
    }

    pub async fn phase(&self) -> Phase {
        self.state.read().await.phase().clone()
    }

    pub async fn selected(&self) -> Option<Peer> {
        self.state.read().await.selected().cloned()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages().to_vec()
    }

    /// Recent shared images of the open conversation, newest first.
    pub async fn media_gallery(&self) -> Vec<String> {
        let state = self.state.read().await;
        chat::media_gallery(state.messages())
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Select `peer` and load its history. A result that arrives after the
    /// selection changed is dropped.
    pub async fn select(&self, peer: Peer) -> Result<()> {
        info!("Selecting conversation with {}", peer);
        let ticket = self.state.write().await.select(peer);
        self.bus.publish(Event::ConversationChanged);
        self.load_history(ticket).await
    }

    /// Select a peer known to the directory.
    pub async fn select_id(&self, peer: &PeerId) -> Result<()> {
        match self.directory.peer(peer).await {
            Some(peer) => self.select(peer).await,
            None => Err(ChatError::Validation(format!("unknown peer {}", peer))),
        }
    }

    pub async fn deselect(&self) {
        self.state.write().await.deselect();
        self.bus.publish(Event::ConversationChanged);
    }

    /// Forget everything, e.g. on logout.
    pub async fn reset(&self) {
        self.deselect().await;
    }

    async fn load_history(&self, ticket: LoadTicket) -> Result<()> {
        match self.api.history(&ticket.peer).await {
            Ok(history) => {
                let count = history.len();
                let outcome = self.state.write().await.apply_history(&ticket, history);
                match outcome {
                    HistoryOutcome::Applied { newly_seen } => {
                        debug!("Loaded {} messages with {}", count, ticket.peer);
                        self.directory.clear_unseen(&ticket.peer).await;
                        for id in newly_seen {
                            self.mark_seen(&id).await;
                        }
                        self.bus.publish(Event::ConversationChanged);
                    }
                    HistoryOutcome::Stale => {
                        debug!("Discarding stale history for {}", ticket.peer);
                    }
                }
                Ok(())
            }
            Err(e) => {
                let outcome = self.state.write().await.apply_history_failure(&ticket);
                if outcome == FailureOutcome::Stale {
                    debug!("Ignoring failed stale history fetch for {}", ticket.peer);
                    return Ok(());
                }
                if e.is_auth() {
                    self.expire_session().await;
                    return Err(e);
                }

                warn!("Failed to load messages with {}: {}", ticket.peer, e);
                self.bus.notify(
                    NotificationLevel::Error,
                    format!("Failed to load messages: {}", e.user_message()),
                );
                if let FailureOutcome::FellBackToReady { newly_seen } = outcome {
                    for id in newly_seen {
                        self.mark_seen(&id).await;
                    }
                }
                self.bus.publish(Event::ConversationChanged);
                Err(e)
            }
        }
    }

    /// Send text and/or an image to the selected peer. Empty content is
    /// rejected before any network call; with no peer selected this is a
    /// no-op returning `Ok(None)`. The message is shown only after the
    /// server accepts it.
    pub async fn send(&self, text: Option<String>, image: Option<String>) -> Result<Option<Message>> {
        let outgoing = match OutgoingMessage::new(text, image) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                self.bus.notify(NotificationLevel::Warning, e.user_message());
                return Err(e);
            }
        };

        let Some(peer) = self.state.read().await.selected_id().cloned() else {
            debug!("Send ignored: no conversation selected");
            return Ok(None);
        };

        let message = match self.api.send(&peer, &outgoing).await {
            Ok(message) => message,
            Err(e) if e.is_auth() => {
                self.expire_session().await;
                return Err(e);
            }
            Err(e) => {
                warn!("Failed to send message to {}: {}", peer, e);
                self.bus.notify(
                    NotificationLevel::Error,
                    format!("Failed to send message: {}", e.user_message()),
                );
                return Err(e);
            }
        };

        if self.state.write().await.record_sent(message.clone()) {
            self.bus.publish(Event::ConversationChanged);
        }

        self.session
            .emit(OutboundEvent::MessageSent {
                to: peer,
                message: message.clone(),
            })
            .await;

        Ok(Some(message))
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<Option<Message>> {
        self.send(Some(text.into()), None).await
    }

    pub async fn send_image(&self, data_url: impl Into<String>) -> Result<Option<Message>> {
        self.send(None, Some(data_url.into())).await
    }

    /// Apply a realtime message.
    pub async fn handle_incoming(&self, message: Message) {
        let id = message.id.clone();
        let outcome = self.state.write().await.incoming(message);

        match outcome {
            IncomingOutcome::Appended => {
                self.bus.publish(Event::ConversationChanged);
                self.mark_seen(&id).await;
            }
            IncomingOutcome::Unseen(sender) => {
                self.directory.increment_unseen(&sender).await;
            }
            IncomingOutcome::Buffered => debug!("Buffered message {} until history loads", id),
            IncomingOutcome::Duplicate => debug!("Ignoring duplicate message {}", id),
        }
    }

    async fn mark_seen(&self, id: &str) {
        match self.api.mark_seen(id).await {
            Ok(()) => {}
            Err(e) if e.is_auth() => self.expire_session().await,
            Err(e) => warn!("Failed to mark message {} as seen: {}", id, e),
        }
    }

    /// The server rejected our token: sign out and forget the session's
    /// conversation and directory.
    async fn expire_session(&self) {
        if self.session.expire().await {
            self.reset().await;
            self.directory.clear().await;
        }
    }
}
