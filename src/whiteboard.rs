//! Whiteboard sync engine — per-record last-writer-wins replication.
//!
//! The whiteboard is a map of independently addressable records (shapes,
//! bindings, pages, assets). Records are rarely co-edited at sub-record
//! granularity, so record-level LWW converges with low latency and no
//! transform machinery:
//!
//! ```text
//! Local edit                        Remote patch
//!     │                                  │
//!     ▼                                  ▼
//! revision += 1                    per-record LWW merge
//! stamp writer                     (higher revision wins,
//! doc seq += 1                      tie → smaller writer id)
//!     │                                  │
//!     ▼                                  ▼
//! WhiteboardPatch ──broadcast──►   doc seq += 1
//! (changed records only)           gap? → snapshot request
//! ```
//!
//! The winner function is pure and identical on every peer, so any
//! delivery order of the same patch set produces bit-identical maps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Record type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    Shape = 1,
    Binding = 2,
    Page = 3,
    Asset = 4,
}

/// An addressable unit of drawing state.
///
/// `attrs` is the opaque attribute payload supplied by the document-model
/// library; the engine never inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhiteboardRecord {
    pub id: Uuid,
    pub kind: RecordKind,
    pub attrs: Vec<u8>,
    /// Strictly increases with every mutation applied to this record.
    pub revision: u64,
    /// Identity of the participant that produced this version.
    pub last_writer: Uuid,
}

impl WhiteboardRecord {
    /// LWW winner predicate: does `self` beat `other` for the same id?
    ///
    /// Higher revision wins; equal revisions fall back to the smaller
    /// writer id. Both peers evaluate the same pure function, so the
    /// outcome is identical regardless of which side is "local".
    pub fn wins_over(&self, other: &WhiteboardRecord) -> bool {
        self.revision > other.revision
            || (self.revision == other.revision && self.last_writer < other.last_writer)
    }
}

/// The shared drawing document: record map plus a document-level
/// sequence number used for gap detection.
///
/// Records live in a `BTreeMap` so that snapshot encoding is
/// deterministic across peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhiteboardDocument {
    pub records: BTreeMap<Uuid, WhiteboardRecord>,
    /// Incremented on every applied mutation, local or remote.
    pub seq: u64,
}

impl WhiteboardDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<&WhiteboardRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A broadcast mutation: only the changed records, never the whole map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhiteboardPatch {
    /// Sender's document sequence number after applying the mutation.
    pub base_seq: u64,
    pub records: Vec<WhiteboardRecord>,
}

/// Engine sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No document yet.
    Empty,
    /// Waiting for the first valid snapshot reply with this request id.
    Syncing { request_id: Uuid },
    /// Converged and accepting edits.
    Live,
}

/// Result of applying a remote patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Merged; `changed` records actually replaced local state.
    Applied { changed: usize },
    /// Patch base sequence is ahead by more than one — missing patches.
    /// The engine has entered Syncing; broadcast a snapshot request
    /// carrying `request_id`.
    Gap { request_id: Uuid },
}

/// Result of applying a snapshot reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Reply accepted; `changed` records were replaced.
    Applied { changed: usize },
    /// Not syncing, or request id did not match — late/duplicate reply.
    Ignored,
}

/// Per-document whiteboard engine for one peer.
pub struct WhiteboardEngine {
    local_id: Uuid,
    doc: WhiteboardDocument,
    state: SyncState,
    /// Remote patches merged since the last durability flush.
    patches_since_flush: u32,
}

impl WhiteboardEngine {
    /// Open a document: empty or restored from a persisted snapshot.
    /// Either way the engine is immediately Live.
    pub fn open(local_id: Uuid, restored: Option<WhiteboardDocument>) -> Self {
        Self {
            local_id,
            doc: restored.unwrap_or_default(),
            state: SyncState::Live,
            patches_since_flush: 0,
        }
    }

    /// Join an in-progress session. The engine starts in Syncing; the
    /// caller must broadcast a snapshot request carrying the returned id.
    pub fn join(local_id: Uuid) -> (Self, Uuid) {
        let request_id = Uuid::new_v4();
        let engine = Self {
            local_id,
            doc: WhiteboardDocument::new(),
            state: SyncState::Syncing { request_id },
            patches_since_flush: 0,
        };
        (engine, request_id)
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn doc(&self) -> &WhiteboardDocument {
        &self.doc
    }

    /// Full document value for snapshot replies and durability flushes.
    pub fn snapshot(&self) -> WhiteboardDocument {
        self.doc.clone()
    }

    /// Whether this peer is synced enough to answer snapshot requests.
    pub fn can_answer_snapshot(&self) -> bool {
        self.state == SyncState::Live
    }

    /// Apply a local mutation: bump the record revision, stamp the local
    /// identity, bump the document sequence, and return the patch to
    /// broadcast (changed record only).
    pub fn upsert_local(&mut self, id: Uuid, kind: RecordKind, attrs: Vec<u8>) -> WhiteboardPatch {
        let revision = self.doc.records.get(&id).map_or(0, |r| r.revision) + 1;
        let record = WhiteboardRecord {
            id,
            kind,
            attrs,
            revision,
            last_writer: self.local_id,
        };
        self.doc.records.insert(id, record.clone());
        self.doc.seq += 1;
        WhiteboardPatch {
            base_seq: self.doc.seq,
            records: vec![record],
        }
    }

    /// Merge a remote patch record-by-record.
    ///
    /// A sequence gap (patch more than one ahead of the local sequence)
    /// switches the engine to Syncing and asks the caller to broadcast a
    /// snapshot request instead of guessing at missing diffs.
    pub fn apply_remote(&mut self, patch: &WhiteboardPatch) -> ApplyOutcome {
        if self.state == SyncState::Live && patch.base_seq > self.doc.seq + 1 {
            // The record merge is order-independent, so this patch's
            // content is kept; the resync only recovers the missed ones.
            self.merge_records(&patch.records);
            let request_id = Uuid::new_v4();
            self.state = SyncState::Syncing { request_id };
            log::debug!(
                "whiteboard sequence gap: patch base {} vs local {}, resyncing",
                patch.base_seq,
                self.doc.seq
            );
            return ApplyOutcome::Gap { request_id };
        }

        let changed = self.merge_records(&patch.records);
        self.doc.seq += 1;
        self.patches_since_flush += 1;
        ApplyOutcome::Applied { changed }
    }

    /// Apply a snapshot reply. Only the first valid reply for the
    /// outstanding request is accepted; anything else is a cheap no-op.
    ///
    /// Merging is LWW per record rather than wholesale replacement, so a
    /// reply that matches local state exactly changes nothing.
    pub fn apply_snapshot_reply(
        &mut self,
        request_id: Uuid,
        snapshot: &WhiteboardDocument,
    ) -> SnapshotOutcome {
        match self.state {
            SyncState::Syncing { request_id: want } if want == request_id => {}
            _ => return SnapshotOutcome::Ignored,
        }

        let changed = self.merge_records_iter(snapshot.records.values());
        if snapshot.seq > self.doc.seq {
            self.doc.seq = snapshot.seq;
        }
        self.state = SyncState::Live;
        log::debug!("whiteboard resynced: {changed} records updated, seq {}", self.doc.seq);
        SnapshotOutcome::Applied { changed }
    }

    /// Remote patches merged since the last flush; reset by the caller
    /// when a durability snapshot is taken.
    pub fn take_flush_counter(&mut self) -> u32 {
        std::mem::take(&mut self.patches_since_flush)
    }

    fn merge_records(&mut self, records: &[WhiteboardRecord]) -> usize {
        self.merge_records_iter(records.iter())
    }

    fn merge_records_iter<'a, I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = &'a WhiteboardRecord>,
    {
        let mut changed = 0;
        for incoming in records {
            match self.doc.records.get(&incoming.id) {
                Some(current) if !incoming.wins_over(current) => {}
                _ => {
                    self.doc.records.insert(incoming.id, incoming.clone());
                    changed += 1;
                }
            }
        }
        changed
    }
}
