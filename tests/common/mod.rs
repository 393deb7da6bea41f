#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use quickchat::api::{
    AuthApi, AuthGrant, ChatApi, LoginCredentials, PeerListing, ProfilePatch, SignupCredentials,
};
use quickchat::chat::{Message, OutgoingMessage};
use quickchat::config::{HistoryFailurePolicy, RealtimeOrdering};
use quickchat::entity::{Identity, Peer, PeerId};
use quickchat::realtime::{ChannelHandle, InboundEvent, OutboundEvent, RealtimeConnector};
use quickchat::store::Store;
use quickchat::{ChatClient, ChatError, Collaborators, Config, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

pub const ME: &str = "me";
pub const EMAIL: &str = "me@example.com";
pub const PASSWORD: &str = "hunter2";

pub fn identity(id: &str, name: &str) -> Identity {
    Identity {
        id: PeerId::new(id),
        display_name: name.to_string(),
        avatar: None,
        bio: None,
        email: None,
    }
}

pub fn peer(id: &str, name: &str) -> Peer {
    Peer {
        id: PeerId::new(id),
        display_name: name.to_string(),
        avatar: None,
        bio: None,
        email: None,
    }
}

pub fn msg(id: &str, from: &str, to: &str) -> Message {
    Message {
        id: id.to_string(),
        sender_id: PeerId::new(from),
        recipient_id: PeerId::new(to),
        text: Some(format!("text of {}", id)),
        image: None,
        created_at: Utc::now(),
        seen: false,
    }
}

pub fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.clone()).collect()
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

pub struct FakeAuth {
    accounts: Mutex<HashMap<String, (String, Identity)>>,
    tokens: Mutex<HashMap<String, Identity>>,
    pub current_token: Mutex<Option<String>>,
    pub offline: AtomicBool,
    pub calls: Mutex<Vec<String>>,
    check_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeAuth {
    pub fn new() -> Self {
        let accounts = HashMap::from([(
            EMAIL.to_string(),
            (PASSWORD.to_string(), identity(ME, "Me Myself")),
        )]);
        Self {
            accounts: Mutex::new(accounts),
            tokens: Mutex::new(HashMap::new()),
            current_token: Mutex::new(None),
            offline: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            check_gate: Mutex::new(None),
        }
    }

    /// Hold token checks until the returned handle is notified.
    pub fn gate_check(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.check_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Make `token` valid for the default account.
    pub fn issue_token(&self, token: &str) {
        self.tokens
            .lock()
            .unwrap()
            .insert(token.to_string(), identity(ME, "Me Myself"));
    }

    pub fn revoke_all(&self) {
        self.tokens.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) -> Result<()> {
        self.calls.lock().unwrap().push(call.to_string());
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChatError::Network("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthApi for FakeAuth {
    async fn set_token(&self, token: Option<String>) {
        *self.current_token.lock().unwrap() = token;
    }

    async fn check(&self, token: &str) -> Result<Identity> {
        self.record("check")?;
        let gate = self.check_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or_else(|| ChatError::Auth("jwt expired".to_string()))
    }

    async fn login(&self, credentials: &LoginCredentials) -> Result<AuthGrant> {
        self.record("login")?;
        let accounts = self.accounts.lock().unwrap();
        match accounts.get(&credentials.email) {
            Some((password, identity)) if password == &credentials.password => {
                let token = format!("token-{}", identity.id);
                self.tokens
                    .lock()
                    .unwrap()
                    .insert(token.clone(), identity.clone());
                Ok(AuthGrant {
                    token,
                    identity: identity.clone(),
                })
            }
            _ => Err(ChatError::Auth("Invalid credentials".to_string())),
        }
    }

    async fn signup(&self, credentials: &SignupCredentials) -> Result<AuthGrant> {
        self.record("signup")?;
        let mut accounts = self.accounts.lock().unwrap();
        if accounts.contains_key(&credentials.email) {
            return Err(ChatError::Auth("Account already exists".to_string()));
        }
        let identity = identity(&format!("u{}", accounts.len() + 1), &credentials.full_name);
        accounts.insert(
            credentials.email.clone(),
            (credentials.password.clone(), identity.clone()),
        );
        let token = format!("token-{}", identity.id);
        self.tokens
            .lock()
            .unwrap()
            .insert(token.clone(), identity.clone());
        Ok(AuthGrant { token, identity })
    }

    async fn update_profile(&self, patch: &ProfilePatch) -> Result<Identity> {
        self.record("update_profile")?;
        let token = self
            .current_token
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ChatError::Auth("Not authorized".to_string()))?;
        let mut tokens = self.tokens.lock().unwrap();
        let identity = tokens
            .get_mut(&token)
            .ok_or_else(|| ChatError::Auth("jwt expired".to_string()))?;

        if let Some(name) = &patch.full_name {
            identity.display_name = name.clone();
        }
        if let Some(bio) = &patch.bio {
            identity.bio = Some(bio.clone());
        }
        if patch.avatar.is_some() {
            // The server stores uploads and hands back a URL
            identity.avatar = Some(format!("https://cdn.example.com/{}.png", identity.id));
        }
        Ok(identity.clone())
    }
}

// ---------------------------------------------------------------------------
// Directory / history
// ---------------------------------------------------------------------------

pub struct FakeChat {
    pub peers: Mutex<Vec<Peer>>,
    pub unseen: Mutex<HashMap<PeerId, u32>>,
    pub histories: Mutex<HashMap<PeerId, Vec<Message>>>,
    pub failing_history: Mutex<HashSet<PeerId>>,
    pub reject_sends: AtomicBool,
    /// Every call fails as if the token had expired.
    pub expired: AtomicBool,
    gates: Mutex<HashMap<PeerId, Arc<Notify>>>,
    peers_gate: Mutex<Option<Arc<Notify>>>,
    pub calls: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl FakeChat {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(vec![peer("a", "Alison"), peer("b", "Bob")]),
            unseen: Mutex::new(HashMap::new()),
            histories: Mutex::new(HashMap::new()),
            failing_history: Mutex::new(HashSet::new()),
            reject_sends: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            gates: Mutex::new(HashMap::new()),
            peers_gate: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_history(&self, peer: &str, messages: Vec<Message>) {
        self.histories
            .lock()
            .unwrap()
            .insert(PeerId::new(peer), messages);
    }

    pub fn fail_history(&self, peer: &str) {
        self.failing_history
            .lock()
            .unwrap()
            .insert(PeerId::new(peer));
    }

    /// Hold history fetches for `peer` until the returned handle is
    /// notified.
    pub fn gate_history(&self, peer: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(PeerId::new(peer), gate.clone());
        gate
    }

    /// Hold peer listings until the returned handle is notified.
    pub fn gate_peers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.peers_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.expired.load(Ordering::SeqCst) {
            return Err(ChatError::Auth("jwt expired".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for FakeChat {
    async fn list_peers(&self) -> Result<PeerListing> {
        self.record("list_peers".to_string())?;
        let gate = self.peers_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(PeerListing {
            peers: self.peers.lock().unwrap().clone(),
            unseen: self.unseen.lock().unwrap().clone(),
        })
    }

    async fn history(&self, peer: &PeerId) -> Result<Vec<Message>> {
        self.record(format!("history:{}", peer))?;

        let gate = self.gates.lock().unwrap().get(peer).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.failing_history.lock().unwrap().contains(peer) {
            return Err(ChatError::Network("connection reset".to_string()));
        }
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .unwrap_or_default())
    }

    async fn send(&self, peer: &PeerId, message: &OutgoingMessage) -> Result<Message> {
        self.record(format!("send:{}", peer))?;
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(ChatError::Rejected("Receiver not found".to_string()));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Message {
            id: format!("sent-{}", n),
            sender_id: PeerId::new(ME),
            recipient_id: peer.clone(),
            text: message.text.clone(),
            image: message.image.clone(),
            created_at: Utc::now(),
            seen: false,
        })
    }

    async fn mark_seen(&self, message_id: &str) -> Result<()> {
        self.record(format!("mark_seen:{}", message_id))
    }
}

// ---------------------------------------------------------------------------
// Realtime
// ---------------------------------------------------------------------------

/// In-process channel. Tests push inbound events and inspect what the
/// client emitted.
pub struct LoopbackConnector {
    pub connects: AtomicUsize,
    pub refuse: AtomicBool,
    inbound: Mutex<Option<mpsc::UnboundedSender<InboundEvent>>>,
    sent: Arc<Mutex<Vec<OutboundEvent>>>,
    channels: Mutex<Vec<Arc<AtomicBool>>>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            inbound: Mutex::new(None),
            sent: Arc::new(Mutex::new(Vec::new())),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn push(&self, event: InboundEvent) {
        let inbound = self.inbound.lock().unwrap();
        inbound
            .as_ref()
            .expect("no channel connected")
            .send(event)
            .expect("client inbound closed");
    }

    pub fn sent(&self) -> Vec<OutboundEvent> {
        self.sent.lock().unwrap().clone()
    }

    /// Whether the most recently opened channel has been shut down.
    pub fn is_closed(&self) -> bool {
        let channels = self.channels.lock().unwrap();
        channels
            .last()
            .map_or(false, |closed| closed.load(Ordering::SeqCst))
    }

    /// Whether the `n`th opened channel (1-based) has been shut down.
    pub fn channel_closed(&self, n: usize) -> bool {
        self.channels.lock().unwrap()[n - 1].load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeConnector for LoopbackConnector {
    async fn connect(
        &self,
        _identity: &PeerId,
        inbound: mpsc::UnboundedSender<InboundEvent>,
    ) -> Result<ChannelHandle> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ChatError::Realtime("connection refused".to_string()));
        }

        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inbound.lock().unwrap() = Some(inbound);
        let closed = Arc::new(AtomicBool::new(false));
        self.channels.lock().unwrap().push(closed.clone());

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let sent = self.sent.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        closed.store(true, Ordering::SeqCst);
                        break;
                    }
                    Some(event) = outbound_rx.recv() => {
                        sent.lock().unwrap().push(event);
                    }
                }
            }
        });

        Ok(ChannelHandle::new(format!("loopback-{}", n), outbound_tx, shutdown_tx))
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Harness {
    pub client: Arc<ChatClient>,
    pub auth: Arc<FakeAuth>,
    pub chat: Arc<FakeChat>,
    pub realtime: Arc<LoopbackConnector>,
    pub store: Store,
}

pub async fn harness() -> Harness {
    harness_with(RealtimeOrdering::Buffered, HistoryFailurePolicy::ReadyEmpty).await
}

pub async fn harness_with(
    ordering: RealtimeOrdering,
    failure_policy: HistoryFailurePolicy,
) -> Harness {
    let config = Config {
        realtime_ordering: ordering,
        history_failure_policy: failure_policy,
        ..Config::default()
    };

    let auth = Arc::new(FakeAuth::new());
    let chat = Arc::new(FakeChat::new());
    let realtime = Arc::new(LoopbackConnector::new());
    let store = Store::in_memory().await.expect("in-memory store");

    let collaborators = Collaborators {
        auth: auth.clone(),
        chat: chat.clone(),
        realtime: realtime.clone(),
    };
    let client = Arc::new(ChatClient::new(&config, collaborators, store.clone()));

    Harness {
        client,
        auth,
        chat,
        realtime,
        store,
    }
}

impl Harness {
    pub async fn login(&self) -> Identity {
        self.client
            .login(&LoginCredentials {
                email: EMAIL.to_string(),
                password: PASSWORD.to_string(),
            })
            .await
            .expect("login")
    }
}
