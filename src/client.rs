use crate::api::{AuthApi, ChatApi, HttpApi, LoginCredentials, ProfilePatch, SignupCredentials};
use crate::bus::{Event, EventBus};
use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::directory::Directory;
use crate::entity::{Identity, PeerId, PeerView};
use crate::error::Result;
use crate::realtime::{InboundEvent, RealtimeConnector, SocketIoConnector};
use crate::session::SessionStore;
use crate::store::Store;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// External services the client talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthApi>,
    pub chat: Arc<dyn ChatApi>,
    pub realtime: Arc<dyn RealtimeConnector>,
}

impl Collaborators {
    /// REST over HTTP and realtime over Socket.IO, as configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = Arc::new(HttpApi::new(config)?);
        Ok(Self {
            auth: http.clone(),
            chat: http,
            realtime: Arc::new(SocketIoConnector::new(config)),
        })
    }
}

/// The session context: owns the stores and routes realtime events into
/// them one at a time. Create one per application, dispose with
/// [`ChatClient::shutdown`].
pub struct ChatClient {
    bus: Arc<EventBus>,
    session: Arc<SessionStore>,
    directory: Arc<Directory>,
    conversation: Arc<ConversationStore>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(config: &Config, collaborators: Collaborators, store: Store) -> Self {
        let bus = Arc::new(EventBus::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let session = Arc::new(SessionStore::new(
            collaborators.auth,
            collaborators.realtime,
            store,
            bus.clone(),
            inbound_tx,
        ));
        let directory = Arc::new(Directory::new(collaborators.chat.clone(), bus.clone()));
        let conversation = Arc::new(ConversationStore::new(
            collaborators.chat,
            session.clone(),
            directory.clone(),
            bus.clone(),
            config.realtime_ordering,
            config.history_failure_policy,
        ));

        Self {
            bus,
            session,
            directory,
            conversation,
            inbound: Mutex::new(Some(inbound_rx)),
            pump: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn conversation(&self) -> &Arc<ConversationStore> {
        &self.conversation
    }

    /// Resume a persisted session and load the directory.
    pub async fn restore_session(&self) -> Result<Option<Identity>> {
        let identity = self.session.restore_session().await?;
        if identity.is_some() {
            self.refresh_directory().await;
        }
        Ok(identity)
    }

    /// Sign in. Signing in as someone else while a session is open drops
    /// the previous session's conversation and directory.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<Identity> {
        let previous = self.current_id().await;
        let identity = self.session.login(credentials).await?;
        self.signed_in(previous, &identity).await;
        Ok(identity)
    }

    pub async fn signup(&self, credentials: &SignupCredentials) -> Result<Identity> {
        let previous = self.current_id().await;
        let identity = self.session.signup(credentials).await?;
        self.signed_in(previous, &identity).await;
        Ok(identity)
    }

    async fn current_id(&self) -> Option<PeerId> {
        self.session.identity().await.map(|identity| identity.id)
    }

    async fn signed_in(&self, previous: Option<PeerId>, identity: &Identity) {
        if previous.is_some_and(|previous| previous != identity.id) {
            info!("Switched identity to {}, dropping previous session state", identity.id);
            self.conversation.reset().await;
            self.directory.clear().await;
        }
        self.refresh_directory().await;
    }

    pub async fn logout(&self) {
        self.session.logout().await;
        self.conversation.reset().await;
        self.directory.clear().await;
    }

    pub async fn update_profile(&self, patch: &ProfilePatch) -> Result<Identity> {
        let result = self.session.update_profile(patch).await;
        if let Err(e) = &result {
            if e.is_auth() {
                self.expire_session().await;
            }
        }
        result
    }

    /// Peers matching `query`, with presence.
    pub async fn peers(&self, query: &str) -> Vec<PeerView> {
        let online = self.session.online_peers().await;
        self.directory.search(query, &online).await
    }

    /// Apply one realtime event. Events arriving while signed out are
    /// dropped.
    pub async fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::OnlinePeers(peers) => {
                if !self.session.is_authenticated().await {
                    return;
                }
                self.session.apply_online_snapshot(peers).await;
                // Presence changes can reveal new peers too
                self.refresh_directory().await;
            }
            InboundEvent::NewMessage(message) => {
                if !self.session.is_authenticated().await {
                    debug!("Dropping message {} received while signed out", message.id);
                    return;
                }
                self.conversation.handle_incoming(message).await;
            }
            InboundEvent::Disconnected => {
                info!("Realtime channel disconnected, keeping last known state");
                self.bus.publish(Event::ConnectionChanged { connected: false });
            }
            InboundEvent::Reconnected => {
                info!("Realtime channel reconnected");
                self.bus.publish(Event::ConnectionChanged { connected: true });
            }
        }
    }

    /// Pump realtime events until the client is shut down. Only one pump
    /// can run; later calls return immediately.
    pub async fn run_realtime(&self) {
        let receiver = self.inbound.lock().await.take();
        let Some(mut receiver) = receiver else {
            warn!("Realtime pump already running");
            return;
        };

        while let Some(event) = receiver.recv().await {
            self.handle_event(event).await;
        }
        debug!("Realtime pump finished");
    }

    pub async fn spawn_realtime(self: &Arc<Self>) {
        let client = self.clone();
        let handle = tokio::spawn(async move {
            client.run_realtime().await;
        });
        *self.pump.lock().await = Some(handle);
    }

    /// Close the realtime channel and stop the pump. The persisted token
    /// is kept.
    pub async fn shutdown(&self) {
        self.session.dispose().await;
        if let Some(handle) = self.pump.lock().await.take() {
            handle.abort();
        }
        info!("Chat client shut down");
    }

    async fn refresh_directory(&self) {
        // Failures are already reported on the bus
        if let Err(e) = self.directory.refresh_peers().await {
            if e.is_auth() {
                self.expire_session().await;
            }
        }
    }

    /// Sign out after the server rejected the session's token.
    async fn expire_session(&self) {
        if self.session.expire().await {
            self.conversation.reset().await;
            self.directory.clear().await;
        }
    }
}
