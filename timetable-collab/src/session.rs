//! One live document: replica, presence table, connections and fan-out.
//!
//! ```text
//!             ┌──────────────── Session ("schedule-cs-100-fall") ───────────────┐
//!             │  Mutex<SessionState>                                            │
//! conn A ──►  │    ScheduleDoc  ·  AwarenessStore  ·  {ConnectionId → info}     │
//!             │  broadcast::Sender<Arc<SessionEvent>>  ──► rx A, rx B, rx C     │
//!             └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All mutation goes through the state mutex, held for one merge-and-publish
//! step and never across a network send. Publishing is a non-blocking push
//! into a bounded broadcast channel, so events leave in merge order and a
//! slow receiver lags instead of stalling the sender.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::awareness::{AwarenessStore, AwarenessUpdate, ClientId};
use crate::document::ScheduleDoc;
use crate::protocol::PresenceUser;

/// Identifies one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which real-time path a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Binary CRDT sync plus awareness.
    Crdt,
    /// JSON presence and verbatim cell relay only.
    Presence,
}

/// What the session knows about a connection. The socket itself is owned
/// by the connection task; the session only reaches it through fan-out.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub channel: Channel,
    /// Awareness client ids this connection speaks for.
    pub clients: HashSet<ClientId>,
}

/// Something every other member of the session may need to hear about.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A CRDT update that changed the replica.
    Document {
        origin: ConnectionId,
        update: Arc<Vec<u8>>,
    },
    /// Changed presence subset plus the resulting user list.
    Awareness {
        origin: ConnectionId,
        changes: AwarenessUpdate,
        users: Arc<Vec<PresenceUser>>,
    },
    /// Opaque cell payload from the presence channel.
    CellUpdate {
        origin: ConnectionId,
        client_id: ClientId,
        cell_id: String,
        cell_data: serde_json::Value,
    },
}

impl SessionEvent {
    pub fn origin(&self) -> ConnectionId {
        match self {
            Self::Document { origin, .. }
            | Self::Awareness { origin, .. }
            | Self::CellUpdate { origin, .. } => *origin,
        }
    }
}

/// Mutable state of a session, only reachable through [`Session::lock`].
#[derive(Debug)]
pub struct SessionState {
    pub doc: ScheduleDoc,
    pub awareness: AwarenessStore,
    connections: HashMap<ConnectionId, ConnectionInfo>,
    owners: HashMap<ClientId, ConnectionId>,
    closed: bool,
    reclaim_epoch: u64,
    reaper: Option<AbortHandle>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            doc: ScheduleDoc::new(),
            awareness: AwarenessStore::new(),
            connections: HashMap::new(),
            owners: HashMap::new(),
            closed: false,
            reclaim_epoch: 0,
            reaper: None,
        }
    }

    /// Register a connection. Cancels any pending reclamation.
    pub fn attach(&mut self, id: ConnectionId, channel: Channel) {
        self.cancel_reclaim();
        self.connections.insert(
            id,
            ConnectionInfo {
                channel,
                clients: HashSet::new(),
            },
        );
    }

    /// Unregister a connection and release the client ids it owned.
    pub fn detach(&mut self, id: ConnectionId) -> Option<ConnectionInfo> {
        let info = self.connections.remove(&id)?;
        for client_id in &info.clients {
            self.owners.remove(client_id);
        }
        Some(info)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionInfo> {
        self.connections.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Bind `client_id` to `conn`. Fails if another connection owns it.
    pub fn claim_client(&mut self, conn: ConnectionId, client_id: ClientId) -> bool {
        match self.owners.get(&client_id) {
            Some(owner) => *owner == conn,
            None => {
                let Some(info) = self.connections.get_mut(&conn) else {
                    return false;
                };
                info.clients.insert(client_id);
                self.owners.insert(client_id, conn);
                true
            }
        }
    }

    pub fn owner_of(&self, client_id: ClientId) -> Option<ConnectionId> {
        self.owners.get(&client_id).copied()
    }

    /// Active users as presence rows, ordered by client id.
    pub fn users(&self) -> Vec<PresenceUser> {
        self.awareness
            .users()
            .into_iter()
            .map(|(id, record)| PresenceUser::from_record(id, record))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn reclaim_epoch(&self) -> u64 {
        self.reclaim_epoch
    }

    pub(crate) fn arm_reclaim(&mut self, handle: AbortHandle) {
        if let Some(previous) = self.reaper.replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn cancel_reclaim(&mut self) {
        self.reclaim_epoch = self.reclaim_epoch.wrapping_add(1);
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }

    /// Mark destroyed and drop replica and presence.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.reaper = None;
        self.awareness.clear();
        self.owners.clear();
        self.doc = ScheduleDoc::new();
    }
}

/// A live document session.
pub struct Session {
    name: String,
    state: Mutex<SessionState>,
    events: broadcast::Sender<Arc<SessionEvent>>,
    published: AtomicU64,
}

impl Session {
    /// `capacity` bounds how many events a receiver may fall behind before
    /// it starts losing them.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            state: Mutex::new(SessionState::new()),
            events,
            published: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the session's serialized mutation path.
    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// New fan-out receiver. Subscribe while holding the lock to avoid
    /// missing events published between onboarding and subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SessionEvent>> {
        self.events.subscribe()
    }

    /// Push an event to every subscriber. Returns the receiver count.
    pub fn publish(&self, event: SessionEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.events.send(Arc::new(event)).unwrap_or(0)
    }

    /// Events published since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connection_count()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("name", &self.name).finish()
    }
}
