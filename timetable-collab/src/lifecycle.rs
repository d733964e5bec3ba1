//! Connection admission and release.
//!
//! Every connection goes through exactly one `admit` and exactly one
//! `release`. `release` consumes the [`ConnectionHandle`], so graceful
//! leaves and abrupt transport failures converge on the same path and the
//! handle cannot be released twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::awareness::{AwarenessUpdate, ClientId, PresenceRecord};
use crate::protocol::{Outbound, UserInfo};
use crate::registry::SessionRegistry;
use crate::session::{Channel, ConnectionId, Session, SessionEvent};
use crate::sync::{publish_awareness, SyncEngine};

/// First id handed out on the presence channel. CRDT clients pick 32-bit
/// ids, so server-generated ones start above that range.
pub const PRESENCE_CLIENT_ID_BASE: ClientId = 1 << 32;

/// A connection's membership in a session.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    channel: Channel,
    session: Arc<Session>,
    events: broadcast::Receiver<Arc<SessionEvent>>,
    client_id: Option<ClientId>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Server-assigned client id (presence channel only).
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    /// Fan-out receiver for this connection.
    pub fn events(&mut self) -> &mut broadcast::Receiver<Arc<SessionEvent>> {
        &mut self.events
    }
}

/// Result of admitting a connection.
#[derive(Debug)]
pub struct Admission {
    pub handle: ConnectionHandle,
    /// Frames to send before anything else.
    pub onboarding: Vec<Outbound>,
}

/// Admits connections into sessions and tears them down.
pub struct ConnectionManager {
    registry: Arc<SessionRegistry>,
    engine: SyncEngine,
    next_presence_client: AtomicU64,
}

impl ConnectionManager {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            engine: SyncEngine::new(),
            next_presence_client: AtomicU64::new(PRESENCE_CLIENT_ID_BASE),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Admit a CRDT-channel connection for `document`.
    ///
    /// Onboarding is our state vector followed by a full awareness snapshot.
    pub async fn admit(&self, document: &str) -> Admission {
        loop {
            let session = self.registry.get_or_create(document).await;
            let id = ConnectionId::new();

            let mut state = session.lock().await;
            // Lost a race with reclamation; the registry no longer holds it.
            if state.is_closed() {
                continue;
            }
            state.attach(id, Channel::Crdt);
            let events = session.subscribe();
            let onboarding = self.engine.onboard(&state);
            let peers = state.connection_count();
            drop(state);

            log::info!("{id} joined {document} over CRDT sync ({peers} connected)");
            return Admission {
                handle: ConnectionHandle {
                    id,
                    channel: Channel::Crdt,
                    session,
                    events,
                    client_id: None,
                },
                onboarding,
            };
        }
    }

    /// Admit a presence-channel connection after its `join`.
    ///
    /// The user gets a server-generated client id. The resulting room list is
    /// published to every member, the new one included.
    pub async fn admit_presence(&self, document: &str, user: UserInfo) -> Admission {
        let client_id = self.next_presence_client.fetch_add(1, Ordering::Relaxed);
        let record = PresenceRecord::new(user.user_id, user.user_name);

        loop {
            let session = self.registry.get_or_create(document).await;
            let id = ConnectionId::new();

            let mut state = session.lock().await;
            if state.is_closed() {
                continue;
            }
            state.attach(id, Channel::Presence);
            state.claim_client(id, client_id);
            let events = session.subscribe();
            let changes = match state.awareness.set_local(client_id, record.clone()) {
                Some(entry) => AwarenessUpdate {
                    entries: vec![entry],
                },
                None => AwarenessUpdate::default(),
            };
            publish_awareness(&session, &state, id, changes);
            let peers = state.connection_count();
            drop(state);

            log::info!(
                "{id} ({}, client {client_id}) joined {document} over presence ({peers} connected)",
                record.user_name
            );
            return Admission {
                handle: ConnectionHandle {
                    id,
                    channel: Channel::Presence,
                    session,
                    events,
                    client_id: Some(client_id),
                },
                onboarding: Vec::new(),
            };
        }
    }

    /// Remove a connection from its session.
    ///
    /// Drops its presence, tells the remaining peers once, and arms idle
    /// reclamation when the session became empty.
    pub async fn release(&self, handle: ConnectionHandle) {
        let ConnectionHandle {
            id,
            session,
            events,
            ..
        } = handle;
        // Stop routing fan-out to this connection first.
        drop(events);

        let mut state = session.lock().await;
        let Some(info) = state.detach(id) else {
            log::warn!("{id} released twice from {}", session.name());
            return;
        };

        let removed = state.awareness.remove(info.clients.iter().copied());
        if !removed.is_empty() {
            publish_awareness(&session, &state, id, removed);
        }

        let remaining = state.connection_count();
        if remaining == 0 {
            self.registry.schedule_reclaim(&session, &mut state);
        }
        drop(state);

        log::info!("{id} left {} ({remaining} connected)", session.name());
    }
}
