//! Durable snapshot storage for room documents.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐   periodic flush   ┌───────────────────┐
//! │ SnapshotMgr   │ ─────────────────► │ SnapshotStore     │
//! │ (in-memory)   │                    │ (trait)           │
//! └──────┬────────┘                    └───────┬───────────┘
//!        │ restore on open                     │
//!        ▼                                     ▼
//! ┌───────────────┐          ┌────────────────────────────────┐
//! │ engines       │          │ MemorySnapshotStore (tests)    │
//! │ (restored)    │          │ RocksSnapshotStore (durable)   │
//! └───────────────┘          │   CF "snapshots" — LZ4 payloads│
//!                            │   CF "metadata"  — per-doc info│
//!                            └────────────────────────────────┘
//! ```
//!
//! The store holds opaque bincode payloads keyed by room and document
//! kind. A failed save is retried on the next flush tick; reads happen
//! once, at open time, when no live peer can answer a snapshot request.

pub mod rocks;

pub use rocks::{RocksSnapshotStore, StoreConfig};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Which document a snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DocumentKind {
    Whiteboard = 1,
    Notes = 2,
}

/// Storage errors. Persist failures are logged by the snapshot manager
/// and retried on the next tick; they never reach the user.
#[derive(Debug, Clone)]
pub enum StoreError {
    DatabaseError(String),
    SerializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "serialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable storage for room document snapshots.
///
/// Implementations are synchronous; the snapshot manager calls them
/// from flush ticks where a short blocking write is acceptable.
pub trait SnapshotStore {
    /// Persist a snapshot payload, replacing any previous one for the
    /// same room and kind. `timestamp` is seconds since the epoch.
    fn save_snapshot(
        &self,
        room: Uuid,
        kind: DocumentKind,
        payload: &[u8],
        timestamp: u64,
    ) -> Result<(), StoreError>;

    /// Load the latest snapshot payload, if one exists.
    fn load_snapshot(&self, room: Uuid, kind: DocumentKind)
        -> Result<Option<Vec<u8>>, StoreError>;
}

/// In-memory store for tests, with save-failure injection.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<(Uuid, DocumentKind), (Vec<u8>, u64)>>,
    fail_saves: AtomicU32,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` saves fail with a database error.
    pub fn fail_next_saves(&self, n: u32) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().expect("snapshot map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp of the stored snapshot, if any.
    pub fn saved_at(&self, room: Uuid, kind: DocumentKind) -> Option<u64> {
        self.snapshots
            .lock()
            .expect("snapshot map lock poisoned")
            .get(&(room, kind))
            .map(|(_, ts)| *ts)
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save_snapshot(
        &self,
        room: Uuid,
        kind: DocumentKind,
        payload: &[u8],
        timestamp: u64,
    ) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) > 0 {
            self.fail_saves.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::DatabaseError("injected failure".into()));
        }
        self.snapshots
            .lock()
            .expect("snapshot map lock poisoned")
            .insert((room, kind), (payload.to_vec(), timestamp));
        Ok(())
    }

    fn load_snapshot(
        &self,
        room: Uuid,
        kind: DocumentKind,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .snapshots
            .lock()
            .expect("snapshot map lock poisoned")
            .get(&(room, kind))
            .map(|(payload, _)| payload.clone()))
    }
}
