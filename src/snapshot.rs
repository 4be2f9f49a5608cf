//! Session snapshot manager.
//!
//! Bridges the in-memory engines and the [`SnapshotStore`]: restores
//! persisted documents when a room opens, and flushes dirty documents on
//! a periodic tick and at session end. Persistence is best-effort; a
//! failed save stays dirty and is retried on the next tick while the
//! session keeps running on in-memory state.

use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::notes::NotesDocument;
use crate::storage::{DocumentKind, SnapshotStore, StoreError};
use crate::whiteboard::WhiteboardDocument;

/// Snapshot manager configuration.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// How often the room engine fires a flush tick.
    pub flush_interval: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
        }
    }
}

/// Documents restored from the store when a room opens.
#[derive(Debug, Default)]
pub struct RestoredState {
    pub whiteboard: Option<WhiteboardDocument>,
    pub notes: Option<NotesDocument>,
}

/// What a flush tick accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub flushed: u32,
    pub failed: u32,
}

/// Per-room snapshot manager over a [`SnapshotStore`].
pub struct SnapshotManager<S: SnapshotStore> {
    store: S,
    room: Uuid,
    config: SnapshotConfig,
    whiteboard_dirty: bool,
    notes_dirty: bool,
}

impl<S: SnapshotStore> SnapshotManager<S> {
    pub fn new(store: S, room: Uuid, config: SnapshotConfig) -> Self {
        Self {
            store,
            room,
            config,
            whiteboard_dirty: false,
            notes_dirty: false,
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn is_dirty(&self, kind: DocumentKind) -> bool {
        match kind {
            DocumentKind::Whiteboard => self.whiteboard_dirty,
            DocumentKind::Notes => self.notes_dirty,
        }
    }

    /// Note that a document changed since the last successful flush.
    pub fn mark_dirty(&mut self, kind: DocumentKind) {
        match kind {
            DocumentKind::Whiteboard => self.whiteboard_dirty = true,
            DocumentKind::Notes => self.notes_dirty = true,
        }
    }

    /// Load whatever the store holds for this room. Used at open time
    /// when no live peer is around to answer a snapshot request. A
    /// payload that fails to decode is treated as absent.
    pub fn restore(&self) -> RestoredState {
        RestoredState {
            whiteboard: self.load_doc(DocumentKind::Whiteboard),
            notes: self.load_doc(DocumentKind::Notes),
        }
    }

    fn load_doc<D: serde::de::DeserializeOwned>(&self, kind: DocumentKind) -> Option<D> {
        let payload = match self.store.load_snapshot(self.room, kind) {
            Ok(Some(p)) => p,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("loading {kind:?} snapshot for room {} failed: {e}", self.room);
                return None;
            }
        };
        match bincode::serde::decode_from_slice(&payload, bincode::config::standard()) {
            Ok((doc, _)) => Some(doc),
            Err(e) => {
                log::warn!("stored {kind:?} snapshot for room {} undecodable: {e}", self.room);
                None
            }
        }
    }

    /// Periodic flush: persist whichever documents are dirty. Failures
    /// are logged, leave the document dirty, and are retried next tick.
    pub fn tick(
        &mut self,
        whiteboard: &WhiteboardDocument,
        notes: &NotesDocument,
    ) -> FlushReport {
        let mut report = FlushReport::default();
        if self.whiteboard_dirty {
            match self.save_doc(DocumentKind::Whiteboard, whiteboard) {
                Ok(()) => {
                    self.whiteboard_dirty = false;
                    report.flushed += 1;
                }
                Err(e) => {
                    log::warn!("whiteboard flush for room {} failed, will retry: {e}", self.room);
                    report.failed += 1;
                }
            }
        }
        if self.notes_dirty {
            match self.save_doc(DocumentKind::Notes, notes) {
                Ok(()) => {
                    self.notes_dirty = false;
                    report.flushed += 1;
                }
                Err(e) => {
                    log::warn!("notes flush for room {} failed, will retry: {e}", self.room);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Final flush when the session ends: both documents, dirty or not.
    pub fn session_end(
        &mut self,
        whiteboard: &WhiteboardDocument,
        notes: &NotesDocument,
    ) -> FlushReport {
        self.whiteboard_dirty = true;
        self.notes_dirty = true;
        let report = self.tick(whiteboard, notes);
        if report.failed == 0 {
            log::info!("room {} state persisted at session end", self.room);
        }
        report
    }

    fn save_doc<D: serde::Serialize>(
        &self,
        kind: DocumentKind,
        doc: &D,
    ) -> Result<(), StoreError> {
        let payload = bincode::serde::encode_to_vec(doc, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.store
            .save_snapshot(self.room, kind, &payload, unix_now())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
