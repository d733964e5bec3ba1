//! # timetable-collab: Real-time sync core for shared course schedules
//!
//! Keeps every editor of a schedule grid looking at the same cells and the
//! same set of people, over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  /sync/{doc}  binary  ┌──────────────────────────────┐
//! │ grid editor  │ ◄───────────────────► │ SyncServer                   │
//! │ (Yjs / yrs)  │                       │   ConnectionManager          │
//! └──────────────┘                       │     admit / release          │
//! ┌──────────────┐  /presence     JSON   │   SessionRegistry            │
//! │ presence UI  │ ◄───────────────────► │     doc name → Session       │
//! └──────────────┘                       └──────────────┬───────────────┘
//!                                                       │
//!                                        ┌──────────────┴───────────────┐
//!                                        │ Session                      │
//!                                        │   ScheduleDoc (CRDT)         │
//!                                        │   AwarenessStore (presence)  │
//!                                        │   broadcast fan-out          │
//!                                        └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: Replicated schedule grid (Yrs map of cells)
//! - [`awareness`]: Last-writer-wins presence table
//! - [`protocol`]: Binary sync envelopes and JSON presence messages
//! - [`session`]: One live document with its connections and fan-out
//! - [`registry`]: Session lookup, creation and idle reclamation
//! - [`sync`]: Sync protocol engine
//! - [`lifecycle`]: Connection admission and release
//! - [`server`]: WebSocket server

pub mod awareness;
pub mod config;
pub mod document;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod sync;

// Re-exports for convenience
pub use awareness::{
    AwarenessChanges, AwarenessEntry, AwarenessStore, AwarenessUpdate, ClientId, PresenceRecord,
};
pub use config::ServerConfig;
pub use document::{DocumentError, ScheduleDoc};
pub use error::ServerError;
pub use lifecycle::{Admission, ConnectionHandle, ConnectionManager, PRESENCE_CLIENT_ID_BASE};
pub use protocol::{
    MessageType, Outbound, PresenceEvent, PresenceMessage, PresenceUser, ProtocolError,
    SyncMessage, UserInfo,
};
pub use registry::SessionRegistry;
pub use server::{parse_route, Route, ServerStats, SyncServer};
pub use session::{Channel, ConnectionId, Session, SessionEvent, SessionState};
pub use sync::SyncEngine;
