//! # roomsync — Real-time session sync for video meetings
//!
//! Keeps the shared whiteboard and meeting notes of a room converged
//! across peers over an untrusted relay that only fans frames out.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌─────────────┐
//! │ RoomEngine   │ ◄─────────────────► │ RelayServer │
//! │ (per peer)   │    Binary frames    │ (fan-out)   │
//! └──────┬───────┘                     └──────┬──────┘
//!        │                                    │
//!   ┌────┴─────────────┐              other peers' engines
//!   ▼                  ▼
//! ┌────────────┐  ┌───────────┐  ┌─────────────┐
//! │ Whiteboard │  │ Notes     │  │ Permissions │
//! │ (per-record│  │ (OT over  │  │ (roles +    │
//! │  LWW)      │  │  steps)   │  │  locks)     │
//! └─────┬──────┘  └─────┬─────┘  └─────────────┘
//!       └───────┬───────┘
//!               ▼
//!       ┌───────────────┐
//!       │ SnapshotStore │
//!       │ (RocksDB)     │
//!       └───────────────┘
//! ```
//!
//! The relay never inspects payloads; every peer runs the same
//! deterministic merge rules, so convergence needs no authority. A
//! peer's own frames echo back from the relay and double as
//! acknowledgements.
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`transport`] — Delivery/destination seam plus an in-process hub
//! - [`relay`] — WebSocket relay server and client transport
//! - [`whiteboard`] — Per-record last-writer-wins document
//! - [`notes`] — Operational transformation with a floating local baseline
//! - [`permissions`] — Roles, advisory locks, heartbeat liveness
//! - [`snapshot`] — Dirty-tracking flush of documents to storage
//! - [`storage`] — RocksDB-backed snapshot persistence
//! - [`room`] — Per-room event loop tying the pieces together

pub mod notes;
pub mod permissions;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod snapshot;
pub mod storage;
pub mod transport;
pub mod whiteboard;

// Re-exports for convenience
pub use notes::{NotesDocument, NotesEngine, RemoteOutcome, Step, StepKind};
pub use permissions::{
    Lock, LockDecision, LockTarget, PermissionModel, Role,
};
pub use protocol::{MessageKind, ProtocolError, SyncBody, SyncMessage, PROTOCOL_VERSION};
pub use relay::{RelayConfig, RelayServer, RelayTransport};
pub use room::{RoomConfig, RoomEngine, RoomEvent, RoomNotice};
pub use snapshot::{RestoredState, SnapshotConfig, SnapshotManager};
pub use storage::{
    DocumentKind, MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig, StoreError,
};
pub use transport::{Delivery, Destination, LocalHub, Transport, TransportError};
pub use whiteboard::{
    RecordKind, SyncState, WhiteboardDocument, WhiteboardEngine, WhiteboardPatch, WhiteboardRecord,
};
