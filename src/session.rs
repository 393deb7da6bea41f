//! Authenticated identity, realtime channel and online peers.
//!
//! At most one realtime channel is open per session. Opening is guarded
//! by the presence of a channel handle, so restoring twice without a
//! logout in between never opens a second one.
//!
//! Every change of identity bumps an epoch. Work that started under an
//! older epoch, like a token check racing a logout, is dropped.

use crate::api::{AuthApi, AuthGrant, LoginCredentials, ProfilePatch, SignupCredentials};
use crate::bus::{Event, EventBus, NotificationLevel};
use crate::entity::{Identity, PeerId};
use crate::error::{ChatError, Result};
use crate::realtime::{ChannelHandle, InboundEvent, OutboundEvent, RealtimeConnector};
use crate::store::Store;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct SessionState {
    identity: Option<Identity>,
    online: HashSet<PeerId>,
    channel: Option<ChannelHandle>,
    epoch: u64,
}

pub struct SessionStore {
    auth: Arc<dyn AuthApi>,
    connector: Arc<dyn RealtimeConnector>,
    store: Store,
    bus: Arc<EventBus>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    state: RwLock<SessionState>,
}

impl SessionStore {
    pub fn new(
        auth: Arc<dyn AuthApi>,
        connector: Arc<dyn RealtimeConnector>,
        store: Store,
        bus: Arc<EventBus>,
        inbound: mpsc::UnboundedSender<InboundEvent>,
    ) -> Self {
        Self {
            auth,
            connector,
            store,
            bus,
            inbound,
            state: RwLock::new(SessionState::default()),
        }
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.state.read().await.identity.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.identity.is_some()
    }

    pub async fn has_channel(&self) -> bool {
        self.state.read().await.channel.is_some()
    }

    pub async fn online_peers(&self) -> HashSet<PeerId> {
        self.state.read().await.online.clone()
    }

    pub async fn is_online(&self, peer: &PeerId) -> bool {
        self.state.read().await.online.contains(peer)
    }

    pub async fn epoch(&self) -> u64 {
        self.state.read().await.epoch
    }

    /// Resume the session from the persisted token, if any.
    ///
    /// A rejected token is cleared. A network failure keeps the token so
    /// the next attempt can succeed, and is returned as an error.
    pub async fn restore_session(&self) -> Result<Option<Identity>> {
        let Some(token) = self.store.token().await? else {
            debug!("No persisted token, starting signed out");
            return Ok(None);
        };

        if let Some(identity) = self.identity().await {
            self.open_channel(&identity.id).await;
            return Ok(Some(identity));
        }

        let epoch = self.epoch().await;
        match self.auth.check(&token).await {
            Ok(identity) => {
                {
                    let mut state = self.state.write().await;
                    if state.epoch != epoch {
                        debug!("Session changed while verifying token, discarding result");
                        return Ok(state.identity.clone());
                    }
                    state.identity = Some(identity.clone());
                    state.epoch += 1;
                }
                info!("Session restored for {}", identity.id);
                self.auth.set_token(Some(token)).await;
                self.bus.publish(Event::SessionChanged);
                self.open_channel(&identity.id).await;
                Ok(Some(identity))
            }
            Err(e) if e.is_auth() => {
                if self.epoch().await != epoch {
                    debug!("Session changed while verifying token, keeping it");
                    return Ok(self.identity().await);
                }
                warn!("Persisted token rejected: {}", e);
                self.store.clear_token().await?;
                self.auth.set_token(None).await;
                Ok(None)
            }
            Err(e) => {
                warn!("Could not verify persisted token: {}", e);
                self.bus.notify(NotificationLevel::Error, e.user_message());
                Err(e)
            }
        }
    }

    pub async fn login(&self, credentials: &LoginCredentials) -> Result<Identity> {
        let result = self.auth.login(credentials).await;
        self.accept_grant(result, "Login successful").await
    }

    pub async fn signup(&self, credentials: &SignupCredentials) -> Result<Identity> {
        let result = self.auth.signup(credentials).await;
        self.accept_grant(result, "Signup successful").await
    }

    async fn accept_grant(&self, result: Result<AuthGrant>, success: &str) -> Result<Identity> {
        let grant = match result {
            Ok(grant) => grant,
            Err(e) => {
                warn!("Authentication failed: {}", e);
                self.bus.notify(NotificationLevel::Error, e.user_message());
                return Err(e);
            }
        };

        self.store.set_token(&grant.token).await?;
        self.auth.set_token(Some(grant.token)).await;

        let identity = grant.identity;
        let previous_channel = {
            let mut state = self.state.write().await;
            let switched = state
                .identity
                .as_ref()
                .is_some_and(|current| current.id != identity.id);
            state.identity = Some(identity.clone());
            state.epoch += 1;
            if switched {
                state.online.clear();
                state.channel.take()
            } else {
                None
            }
        };
        if let Some(channel) = previous_channel {
            // The channel is keyed by the identity it was opened for
            info!("Closing realtime channel {} of previous identity", channel.id());
            channel.close();
        }

        info!("Signed in as {}", identity.id);
        self.bus.publish(Event::SessionChanged);
        self.bus.notify(NotificationLevel::Success, success);

        self.open_channel(&identity.id).await;
        Ok(identity)
    }

    /// Clear token, identity and presence and close the channel. Safe to
    /// call at any time.
    pub async fn logout(&self) {
        self.end_session().await;
        info!("Logged out");
        self.bus.notify(NotificationLevel::Success, "Logged out");
    }

    /// End the session after the server rejected its token. Returns
    /// `false` when already signed out.
    pub async fn expire(&self) -> bool {
        if !self.end_session().await {
            return false;
        }
        warn!("Session expired");
        self.bus.notify(
            NotificationLevel::Warning,
            "Session expired, please log in again",
        );
        true
    }

    /// Returns whether an identity was signed in.
    async fn end_session(&self) -> bool {
        if let Err(e) = self.store.clear_token().await {
            warn!("Failed to clear persisted token: {}", e);
        }
        self.auth.set_token(None).await;

        let (was_signed_in, channel) = {
            let mut state = self.state.write().await;
            let was_signed_in = state.identity.take().is_some();
            state.online.clear();
            state.epoch += 1;
            (was_signed_in, state.channel.take())
        };
        if let Some(channel) = channel {
            channel.close();
        }

        self.bus.publish(Event::SessionChanged);
        self.bus.publish(Event::PresenceChanged);
        was_signed_in
    }

    /// Submit `patch`; the server's returned record replaces the identity.
    pub async fn update_profile(&self, patch: &ProfilePatch) -> Result<Identity> {
        if !self.is_authenticated().await {
            return Err(ChatError::NoSession);
        }
        if patch.is_empty() {
            return Err(ChatError::Validation("Nothing to update".to_string()));
        }

        match self.auth.update_profile(patch).await {
            Ok(identity) => {
                self.state.write().await.identity = Some(identity.clone());
                self.bus.publish(Event::SessionChanged);
                self.bus.notify(NotificationLevel::Success, "Profile updated");
                Ok(identity)
            }
            Err(e) => {
                warn!("Profile update failed: {}", e);
                self.bus.notify(NotificationLevel::Error, e.user_message());
                Err(e)
            }
        }
    }

    /// Replace the online-peer set with a snapshot from the channel.
    pub async fn apply_online_snapshot(&self, peers: Vec<PeerId>) {
        let count = peers.len();
        self.state.write().await.online = peers.into_iter().collect();
        debug!("{} peers online", count);
        self.bus.publish(Event::PresenceChanged);
    }

    /// Emit on the open channel. Without one the event is dropped.
    pub async fn emit(&self, event: OutboundEvent) {
        let state = self.state.read().await;
        match state.channel.as_ref() {
            Some(channel) => {
                if let Err(e) = channel.emit(event) {
                    warn!("Realtime emit failed: {}", e);
                }
            }
            None => debug!("No realtime channel, dropping outbound event"),
        }
    }

    /// Close the channel without signing out. The token stays persisted.
    pub async fn dispose(&self) {
        let channel = self.state.write().await.channel.take();
        if let Some(channel) = channel {
            channel.close();
        }
    }

    async fn open_channel(&self, identity: &PeerId) {
        if self.has_channel().await {
            debug!("Realtime channel already open");
            return;
        }

        match self.connector.connect(identity, self.inbound.clone()).await {
            Ok(channel) => {
                let mut state = self.state.write().await;
                // Another open may have won while connecting, and a logout
                // may have happened; the extra handle closes on drop.
                let still_signed_in = state
                    .identity
                    .as_ref()
                    .is_some_and(|current| &current.id == identity);
                if state.channel.is_none() && still_signed_in {
                    info!("Realtime channel {} open", channel.id());
                    state.channel = Some(channel);
                }
            }
            Err(e) => {
                warn!("Realtime channel unavailable: {}", e);
                self.bus.notify(
                    NotificationLevel::Warning,
                    format!("Live updates unavailable: {}", e.user_message()),
                );
            }
        }
    }
}
