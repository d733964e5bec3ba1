//! Replicated schedule document backed by a Yrs CRDT.
//!
//! The grid is stored as a single Yrs map named `cells`, keyed by cell id
//! (e.g. `R3C2`) with an opaque string payload per cell. The server never
//! interprets cell payloads; it only merges and redistributes updates.
//!
//! ```text
//!  peer state vector ──► encode_diff() ──► SyncStep2 payload
//!  remote update     ──► apply_update() ──► changed? ──► rebroadcast
//! ```
//!
//! Merge properties (inherited from Yrs):
//! - applying the same update twice is a no-op
//! - updates commute: A then B and B then A yield the same content

use std::collections::BTreeMap;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, Update};

/// Name of the root map holding grid cells.
const CELLS: &str = "cells";

/// Errors raised while decoding or applying CRDT payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("malformed state vector: {0}")]
    StateVector(String),
    #[error("malformed update: {0}")]
    Update(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
}

/// One replica of a schedule grid.
pub struct ScheduleDoc {
    doc: Doc,
    cells: MapRef,
}

impl ScheduleDoc {
    /// Create an empty replica with a random client id.
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create an empty replica with a fixed client id.
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let cells = doc.get_or_insert_map(CELLS);
        Self { doc, cells }
    }

    /// Compact summary of every update this replica has incorporated.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Minimal update bringing a peer with `remote_sv` up to date.
    ///
    /// An empty `remote_sv` is treated as "knows nothing".
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = if remote_sv.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(remote_sv)
                .map_err(|e| DocumentError::StateVector(e.to_string()))?
        };
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge a remote update into this replica.
    ///
    /// Returns `true` when the update changed local state, `false` when it
    /// was already fully known (or is still waiting on missing dependencies).
    pub fn apply_update(&self, update: &[u8]) -> Result<bool, DocumentError> {
        let update =
            Update::decode_v1(update).map_err(|e| DocumentError::Update(e.to_string()))?;

        let before = self.doc.transact().snapshot();
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))?;
        }
        let after = self.doc.transact().snapshot();

        Ok(before != after)
    }

    /// Write a cell locally and return the resulting incremental update.
    pub fn set_cell(&self, cell_id: &str, payload: &str) -> Vec<u8> {
        let sv = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            self.cells.insert(&mut txn, cell_id, payload.to_string());
        }
        self.doc.transact().encode_diff_v1(&sv)
    }

    /// Clear a cell locally and return the resulting incremental update.
    pub fn remove_cell(&self, cell_id: &str) -> Vec<u8> {
        let sv = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            self.cells.remove(&mut txn, cell_id);
        }
        self.doc.transact().encode_diff_v1(&sv)
    }

    /// Read a single cell payload.
    pub fn cell(&self, cell_id: &str) -> Option<String> {
        let txn = self.doc.transact();
        self.cells.get(&txn, cell_id).and_then(out_to_string)
    }

    /// All cells, ordered by cell id.
    pub fn cells(&self) -> BTreeMap<String, String> {
        let txn = self.doc.transact();
        self.cells
            .iter(&txn)
            .filter_map(|(key, value)| out_to_string(value).map(|v| (key.to_string(), v)))
            .collect()
    }

    /// Deterministic JSON rendering of the document content.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.cells()).unwrap_or_default()
    }

    /// Number of populated cells.
    pub fn len(&self) -> usize {
        self.cells.len(&self.doc.transact()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ScheduleDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScheduleDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleDoc")
            .field("client_id", &self.doc.client_id())
            .field("cells", &self.cells())
            .finish()
    }
}

fn out_to_string(value: Out) -> Option<String> {
    match value {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}
