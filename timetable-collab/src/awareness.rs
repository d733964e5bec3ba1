//! Awareness store: ephemeral "who is on which cell" presence.
//!
//! Presence is independent of document content. Each entry is keyed by a
//! session-scoped client id and versioned by a per-client clock; merges are
//! last-writer-wins per client id.
//!
//! ```text
//! AwarenessUpdate { entries: [(client_id, clock, Some(record) | None)] }
//!        │
//!        ▼
//! AwarenessStore::apply_update()  ──► AwarenessChanges (added/updated/removed)
//!        │
//!        ▼
//! changed subset only ──► rebroadcast
//! ```
//!
//! A `None` state is a removal. Removed clients leave a clock tombstone so a
//! stale update that arrives late cannot resurrect them. Tombstones are kept
//! for [`TOMBSTONE_RETENTION`] and at most [`MAX_TOMBSTONES`] of them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::ProtocolError;

/// Session-scoped participant id.
pub type ClientId = u64;

/// How long a removal is remembered.
pub const TOMBSTONE_RETENTION: Duration = Duration::from_secs(30);

/// Upper bound on remembered removals; the oldest go first.
pub const MAX_TOMBSTONES: usize = 1024;

/// Presence of one participant on the grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub user_name: String,
    /// Cell the user is focused on (`None` = not editing).
    pub active_cell: Option<String>,
}

impl PresenceRecord {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            active_cell: None,
        }
    }

    pub fn with_active_cell(mut self, cell: impl Into<String>) -> Self {
        self.active_cell = Some(cell.into());
        self
    }
}

/// A single client's state at a given clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u32,
    /// `None` means the client is gone.
    pub state: Option<PresenceRecord>,
}

/// Binary-encoded batch of presence changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::Deserialization(format!(
                "{} trailing bytes after awareness update",
                bytes.len() - read
            )));
        }
        Ok(update)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Client ids announced as gone in this update.
    pub fn removed(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.entries
            .iter()
            .filter(|e| e.state.is_none())
            .map(|e| e.client_id)
    }
}

/// Result of merging an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.added
            .iter()
            .chain(self.updated.iter())
            .chain(self.removed.iter())
            .copied()
    }
}

#[derive(Debug, Clone)]
struct ClientState {
    clock: u32,
    record: PresenceRecord,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    clock: u32,
    removed_at: Instant,
    seq: u64,
}

/// Per-session presence table.
#[derive(Debug, Default)]
pub struct AwarenessStore {
    states: HashMap<ClientId, ClientState>,
    /// Last clock seen for clients that have been removed.
    tombstones: HashMap<ClientId, Tombstone>,
    buried: u64,
}

impl AwarenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_clock(&self, client_id: ClientId) -> Option<u32> {
        self.states
            .get(&client_id)
            .map(|s| s.clock)
            .or_else(|| self.tombstones.get(&client_id).map(|t| t.clock))
    }

    fn bury(&mut self, client_id: ClientId, clock: u32) {
        self.buried += 1;
        self.tombstones.insert(
            client_id,
            Tombstone {
                clock,
                removed_at: Instant::now(),
                seq: self.buried,
            },
        );
    }

    /// Forget removals older than [`TOMBSTONE_RETENTION`], then the oldest
    /// ones beyond [`MAX_TOMBSTONES`].
    pub fn prune_tombstones(&mut self) {
        self.tombstones
            .retain(|_, t| t.removed_at.elapsed() < TOMBSTONE_RETENTION);
        while self.tombstones.len() > MAX_TOMBSTONES {
            let oldest = self
                .tombstones
                .iter()
                .min_by_key(|(_, t)| t.seq)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => self.tombstones.remove(&id),
                None => break,
            };
        }
    }

    /// Removals currently remembered.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Merge a remote update, last-writer-wins per client id.
    ///
    /// An entry is accepted when its clock is newer than what we hold, or
    /// when it carries the same clock and announces a removal.
    pub fn apply_update(&mut self, update: &AwarenessUpdate) -> AwarenessChanges {
        let mut changes = AwarenessChanges::default();
        let mut buried = false;

        for entry in &update.entries {
            let accept = match self.current_clock(entry.client_id) {
                None => true,
                Some(clock) => {
                    entry.clock > clock
                        || (entry.clock == clock
                            && entry.state.is_none()
                            && self.states.contains_key(&entry.client_id))
                }
            };
            if !accept {
                continue;
            }

            match &entry.state {
                Some(record) => {
                    self.tombstones.remove(&entry.client_id);
                    let previous = self.states.insert(
                        entry.client_id,
                        ClientState {
                            clock: entry.clock,
                            record: record.clone(),
                        },
                    );
                    match previous {
                        None => changes.added.push(entry.client_id),
                        Some(prev) if prev.record != *record => {
                            changes.updated.push(entry.client_id)
                        }
                        // Clock renewal with identical state.
                        Some(_) => {}
                    }
                }
                None => {
                    self.bury(entry.client_id, entry.clock);
                    buried = true;
                    if self.states.remove(&entry.client_id).is_some() {
                        changes.removed.push(entry.client_id);
                    }
                }
            }
        }

        if buried {
            self.prune_tombstones();
        }
        changes
    }

    /// Set a client's record on behalf of the server (presence-only path).
    ///
    /// Bumps the client's clock and returns the entry to broadcast, or
    /// `None` if the record is unchanged.
    pub fn set_local(&mut self, client_id: ClientId, record: PresenceRecord) -> Option<AwarenessEntry> {
        if let Some(existing) = self.states.get(&client_id) {
            if existing.record == record {
                return None;
            }
        }
        let clock = self.current_clock(client_id).map_or(0, |c| c.wrapping_add(1));
        self.tombstones.remove(&client_id);
        self.states.insert(
            client_id,
            ClientState {
                clock,
                record: record.clone(),
            },
        );
        Some(AwarenessEntry {
            client_id,
            clock,
            state: Some(record),
        })
    }

    /// Remove the given clients and return the removal update to broadcast.
    ///
    /// Clients that hold no entry are skipped.
    pub fn remove<I>(&mut self, client_ids: I) -> AwarenessUpdate
    where
        I: IntoIterator<Item = ClientId>,
    {
        let mut entries = Vec::new();
        for client_id in client_ids {
            if let Some(state) = self.states.remove(&client_id) {
                let clock = state.clock.wrapping_add(1);
                self.bury(client_id, clock);
                entries.push(AwarenessEntry {
                    client_id,
                    clock,
                    state: None,
                });
            }
        }
        if !entries.is_empty() {
            self.prune_tombstones();
        }
        AwarenessUpdate { entries }
    }

    /// Update describing exactly the given clients (current state or removal).
    pub fn update_for<I>(&self, client_ids: I) -> AwarenessUpdate
    where
        I: IntoIterator<Item = ClientId>,
    {
        let entries = client_ids
            .into_iter()
            .filter_map(|client_id| match self.states.get(&client_id) {
                Some(state) => Some(AwarenessEntry {
                    client_id,
                    clock: state.clock,
                    state: Some(state.record.clone()),
                }),
                None => self.tombstones.get(&client_id).map(|t| AwarenessEntry {
                    client_id,
                    clock: t.clock,
                    state: None,
                }),
            })
            .collect();
        AwarenessUpdate { entries }
    }

    /// Full snapshot of every live client, ordered by client id.
    pub fn snapshot(&self) -> AwarenessUpdate {
        let mut ids: Vec<ClientId> = self.states.keys().copied().collect();
        ids.sort_unstable();
        self.update_for(ids)
    }

    /// Every live client plus every remembered removal, ordered by client
    /// id. Replaces whatever a peer that missed updates believes.
    pub fn resync_update(&self) -> AwarenessUpdate {
        let mut ids: Vec<ClientId> = self
            .states
            .keys()
            .chain(self.tombstones.keys())
            .copied()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        self.update_for(ids)
    }

    /// Live records ordered by client id.
    pub fn users(&self) -> Vec<(ClientId, PresenceRecord)> {
        let mut users: Vec<(ClientId, PresenceRecord)> = self
            .states
            .iter()
            .map(|(id, s)| (*id, s.record.clone()))
            .collect();
        users.sort_unstable_by_key(|(id, _)| *id);
        users
    }

    pub fn get(&self, client_id: ClientId) -> Option<&PresenceRecord> {
        self.states.get(&client_id).map(|s| &s.record)
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.states.contains_key(&client_id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drop all presence and tombstones.
    pub fn clear(&mut self) {
        self.states.clear();
        self.tombstones.clear();
    }
}
