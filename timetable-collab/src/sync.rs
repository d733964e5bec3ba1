//! Sync protocol engine.
//!
//! Two-phase handshake on the CRDT channel:
//!
//! ```text
//! server                                   client
//!   │── SyncStep1(server sv) ─────────────────►│   on admission
//!   │── Awareness(full snapshot) ─────────────►│
//!   │◄──────────────────── SyncStep2(diff) ────│   answers our step 1
//!   │◄──────────────────── SyncStep1(sv) ──────│
//!   │── SyncStep2(diff vs client sv) ─────────►│   only reply to a step 1
//!   │◄──────────────────── Update(u) ──────────│
//!   │   apply; if changed ─► publish to every other connection
//! ```
//!
//! Awareness merges are last-writer-wins per client id and only the changed
//! subset is republished, tagged with the originating connection so it is
//! never echoed back. Malformed or out-of-state messages are logged and
//! dropped; nothing here closes a connection.

use std::sync::Arc;

use crate::awareness::{AwarenessUpdate, ClientId, PresenceRecord};
use crate::protocol::{Outbound, PresenceEvent, PresenceMessage, ProtocolError, SyncMessage};
use crate::session::{Channel, ConnectionId, Session, SessionEvent, SessionState};

/// Stateless message router; all state lives in the [`Session`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncEngine;

impl SyncEngine {
    pub fn new() -> Self {
        Self
    }

    /// Frames a freshly admitted CRDT connection receives: our state vector
    /// first, then the complete awareness snapshot.
    pub fn onboard(&self, state: &SessionState) -> Vec<Outbound> {
        let mut out = vec![Outbound::Sync(SyncMessage::SyncStep1(state.doc.state_vector()))];
        match state.awareness.snapshot().encode() {
            Ok(bytes) => out.push(Outbound::Sync(SyncMessage::Awareness(bytes))),
            Err(e) => log::error!("Failed to encode awareness snapshot: {e}"),
        }
        out
    }

    /// Full resync for a connection that lost events to lag.
    ///
    /// The awareness part carries remembered removals too, since the lost
    /// events may have included them.
    pub fn resync(&self, state: &SessionState, channel: Channel) -> Vec<Outbound> {
        match channel {
            Channel::Crdt => {
                let mut out = vec![Outbound::Sync(SyncMessage::SyncStep2(state.doc.encode_state()))];
                match state.awareness.resync_update().encode() {
                    Ok(bytes) => out.push(Outbound::Sync(SyncMessage::Awareness(bytes))),
                    Err(e) => log::error!("Failed to encode awareness resync: {e}"),
                }
                out
            }
            Channel::Presence => vec![Outbound::Presence(PresenceEvent::Awareness {
                users: state.users(),
            })],
        }
    }

    /// Handle one decoded CRDT-channel message. Returns direct replies.
    pub async fn handle_sync_message(
        &self,
        session: &Session,
        conn: ConnectionId,
        msg: SyncMessage,
    ) -> Result<Vec<Outbound>, ProtocolError> {
        match msg {
            SyncMessage::SyncStep1(sv) => {
                let state = session.lock().await;
                ensure_member(&state, conn, Channel::Crdt)?;
                let diff = state
                    .doc
                    .encode_diff(&sv)
                    .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
                Ok(vec![Outbound::Sync(SyncMessage::SyncStep2(diff))])
            }
            SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                self.apply_update(session, conn, update).await?;
                Ok(Vec::new())
            }
            SyncMessage::Awareness(bytes) => {
                let update = AwarenessUpdate::decode(&bytes)?;
                self.handle_awareness(session, conn, update).await?;
                Ok(Vec::new())
            }
            SyncMessage::Ping => Ok(vec![Outbound::Sync(SyncMessage::Pong)]),
            SyncMessage::Pong => Ok(Vec::new()),
        }
    }

    /// Merge a document update; publish it only if it changed the replica.
    pub async fn apply_update(
        &self,
        session: &Session,
        conn: ConnectionId,
        update: Vec<u8>,
    ) -> Result<bool, ProtocolError> {
        let state = session.lock().await;
        ensure_member(&state, conn, Channel::Crdt)?;
        let changed = state
            .doc
            .apply_update(&update)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;

        if changed {
            let receivers = session.publish(SessionEvent::Document {
                origin: conn,
                update: Arc::new(update),
            });
            log::trace!(
                "Update from {conn} merged into {}, fanned out to {} receivers",
                session.name(),
                receivers.saturating_sub(1)
            );
        } else {
            log::trace!("Update from {conn} already known in {}", session.name());
        }
        Ok(changed)
    }

    /// Merge awareness changes from a CRDT connection.
    ///
    /// Entries for client ids owned by another connection are dropped.
    pub async fn handle_awareness(
        &self,
        session: &Session,
        conn: ConnectionId,
        update: AwarenessUpdate,
    ) -> Result<usize, ProtocolError> {
        let mut state = session.lock().await;
        ensure_member(&state, conn, Channel::Crdt)?;

        let mut accepted = AwarenessUpdate::default();
        for entry in update.entries {
            if state.claim_client(conn, entry.client_id) {
                accepted.entries.push(entry);
            } else {
                log::warn!(
                    "{}",
                    ProtocolError::ForeignClient {
                        client_id: entry.client_id
                    }
                );
            }
        }

        let changes = state.awareness.apply_update(&accepted);
        if changes.is_empty() {
            return Ok(0);
        }
        let changed: Vec<ClientId> = changes.all().collect();
        let subset = state.awareness.update_for(changed.iter().copied());
        publish_awareness(session, &state, conn, subset);
        Ok(changed.len())
    }

    /// Handle one decoded presence-channel message from a joined connection.
    ///
    /// `join` is handled by the lifecycle manager before a connection has a
    /// session; a second `join` is ignored.
    pub async fn handle_presence(
        &self,
        session: &Session,
        conn: ConnectionId,
        client_id: ClientId,
        msg: PresenceMessage,
    ) -> Result<Vec<Outbound>, ProtocolError> {
        match msg {
            PresenceMessage::Join { schedule_id, .. } => {
                log::warn!("{conn} sent a second join (for {schedule_id}), ignoring");
                Ok(Vec::new())
            }
            PresenceMessage::Awareness { active_cell } => {
                let mut state = session.lock().await;
                ensure_member(&state, conn, Channel::Presence)?;
                let Some(current) = state.awareness.get(client_id).cloned() else {
                    return Err(ProtocolError::NotJoined);
                };
                let record = PresenceRecord {
                    active_cell,
                    ..current
                };
                // The sender gets the room snapshot too, even when unchanged.
                let changes = match state.awareness.set_local(client_id, record) {
                    Some(entry) => AwarenessUpdate {
                        entries: vec![entry],
                    },
                    None => AwarenessUpdate::default(),
                };
                publish_awareness(session, &state, conn, changes);
                Ok(Vec::new())
            }
            PresenceMessage::CellUpdate { cell_id, cell_data } => {
                let state = session.lock().await;
                ensure_member(&state, conn, Channel::Presence)?;
                session.publish(SessionEvent::CellUpdate {
                    origin: conn,
                    client_id,
                    cell_id,
                    cell_data,
                });
                Ok(Vec::new())
            }
            PresenceMessage::Leave => {
                log::debug!("{conn} announced leave from {}", session.name());
                Ok(Vec::new())
            }
            PresenceMessage::Ping => Ok(vec![Outbound::Presence(PresenceEvent::Pong)]),
        }
    }

    /// Translate a session event into frames for one receiving connection.
    pub fn render(&self, event: &SessionEvent, me: ConnectionId, channel: Channel) -> Vec<Outbound> {
        match (event, channel) {
            (SessionEvent::Document { origin, update }, Channel::Crdt) if *origin != me => {
                vec![Outbound::Sync(SyncMessage::Update(update.as_ref().clone()))]
            }
            (SessionEvent::Awareness { origin, changes, .. }, Channel::Crdt) if *origin != me => {
                if changes.is_empty() {
                    return Vec::new();
                }
                match changes.encode() {
                    Ok(bytes) => vec![Outbound::Sync(SyncMessage::Awareness(bytes))],
                    Err(e) => {
                        log::error!("Failed to encode awareness update: {e}");
                        Vec::new()
                    }
                }
            }
            // Presence clients always receive the full room list.
            (SessionEvent::Awareness { changes, users, .. }, Channel::Presence) => {
                let mut out: Vec<Outbound> = changes
                    .removed()
                    .map(|client_id| Outbound::Presence(PresenceEvent::UserLeft { client_id }))
                    .collect();
                out.push(Outbound::Presence(PresenceEvent::Awareness {
                    users: users.as_ref().clone(),
                }));
                out
            }
            (
                SessionEvent::CellUpdate {
                    origin,
                    client_id,
                    cell_id,
                    cell_data,
                },
                Channel::Presence,
            ) if *origin != me => vec![Outbound::Presence(PresenceEvent::CellUpdate {
                client_id: *client_id,
                cell_id: cell_id.clone(),
                cell_data: cell_data.clone(),
            })],
            _ => Vec::new(),
        }
    }
}

/// Publish an awareness change with the current user list. Call with the
/// session lock held so events leave in merge order.
pub(crate) fn publish_awareness(
    session: &Session,
    state: &SessionState,
    origin: ConnectionId,
    changes: AwarenessUpdate,
) -> usize {
    session.publish(SessionEvent::Awareness {
        origin,
        changes,
        users: Arc::new(state.users()),
    })
}

fn ensure_member(
    state: &SessionState,
    conn: ConnectionId,
    channel: Channel,
) -> Result<(), ProtocolError> {
    match state.connection(conn) {
        None => Err(ProtocolError::NotJoined),
        Some(info) if info.channel != channel => Err(ProtocolError::WrongChannel(match channel {
            Channel::Crdt => "CRDT sync",
            Channel::Presence => "presence",
        })),
        Some(_) => Ok(()),
    }
}
