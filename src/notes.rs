//! Notes sync engine — operational transform with a floating local baseline.
//!
//! Each peer holds three things:
//!
//! ```text
//! confirmed doc (version v) ──► steps every peer has merged
//! pending queue              ──► locally authored steps since v, oldest first
//! rendered doc               ──► confirmed + pending, what the user sees
//! ```
//!
//! A local edit applies optimistically to the rendered doc, joins the
//! pending queue, and is broadcast. An incoming remote step is transformed
//! against everything applied since its base version, advances the
//! confirmed doc, and every queued local step is retransformed against it
//! so it still lands correctly when confirmed. The echo of a peer's own
//! step acts as the acknowledgment that moves the oldest pending step into
//! the confirmed baseline.
//!
//! `transform` is a pure function and commutes: transform(L,R) after R and
//! transform(R,L) after L produce the same document. Concurrent inserts at
//! the same position are ordered by author id so every peer picks the same
//! winner.
//!
//! Positions are byte offsets into UTF-8 text; callers are expected to
//! produce offsets on char boundaries (offsets are clamped defensively).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

pub use crate::whiteboard::SyncState;

/// Default bound on unconfirmed local steps (flow control).
pub const DEFAULT_PENDING_BOUND: usize = 50;

/// Default number of confirmed steps retained for transforming laggard
/// remote steps before falling back to a snapshot resync.
pub const DEFAULT_HISTORY_CAP: usize = 256;

/// An atomic, invertible text edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    /// Insert `text` at byte offset `pos`.
    Insert { pos: usize, text: String },
    /// Delete the byte range `from..to`.
    Delete { from: usize, to: usize },
    /// Apply `mark` over the byte range `from..to`.
    Format { from: usize, to: usize, mark: String },
    /// Remove a previously applied `mark` over `from..to` (Format inverse).
    ClearFormat { from: usize, to: usize, mark: String },
}

impl StepKind {
    /// A step that changes nothing but still consumes a version slot.
    /// Used when a transform collapses a step entirely.
    pub fn noop() -> Self {
        StepKind::Delete { from: 0, to: 0 }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, StepKind::Delete { from, to } if from == to)
    }
}

/// A step tagged with the document version it was authored against and
/// the originating participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub author: Uuid,
    pub base_version: u64,
    pub kind: StepKind,
}

impl Step {
    /// Invert this step against the document it was applied to.
    pub fn invert(&self, doc_before: &NotesDocument) -> Step {
        let kind = match &self.kind {
            StepKind::Insert { pos, text } => StepKind::Delete {
                from: *pos,
                to: pos + text.len(),
            },
            StepKind::Delete { from, to } => {
                let from = clamp_boundary(&doc_before.text, *from);
                let to = clamp_boundary(&doc_before.text, *to).max(from);
                StepKind::Insert {
                    pos: from,
                    text: doc_before.text[from..to].to_string(),
                }
            }
            StepKind::Format { from, to, mark } => StepKind::ClearFormat {
                from: *from,
                to: *to,
                mark: mark.clone(),
            },
            StepKind::ClearFormat { from, to, mark } => StepKind::Format {
                from: *from,
                to: *to,
                mark: mark.clone(),
            },
        };
        Step {
            id: Uuid::new_v4(),
            author: self.author,
            base_version: self.base_version + 1,
            kind,
        }
    }
}

/// A formatting span over the document text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkSpan {
    pub from: usize,
    pub to: usize,
    pub mark: String,
}

/// The shared rich-text document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotesDocument {
    pub text: String,
    pub marks: Vec<MarkSpan>,
    pub version: u64,
}

impl NotesDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a step in place. Every application bumps the version,
    /// including no-op steps (version slots stay aligned across peers).
    pub fn apply(&mut self, step: &Step) {
        match &step.kind {
            StepKind::Insert { pos, text } => {
                let pos = clamp_boundary(&self.text, *pos);
                self.text.insert_str(pos, text);
                let len = text.len();
                for span in &mut self.marks {
                    if pos <= span.from {
                        span.from += len;
                        span.to += len;
                    } else if pos < span.to {
                        span.to += len;
                    }
                }
            }
            StepKind::Delete { from, to } => {
                let from = clamp_boundary(&self.text, *from);
                let to = clamp_boundary(&self.text, *to).max(from);
                self.text.replace_range(from..to, "");
                self.marks.retain_mut(|span| {
                    span.from = map_pos_delete(span.from, from, to);
                    span.to = map_pos_delete(span.to, from, to);
                    span.from < span.to
                });
            }
            StepKind::Format { from, to, mark } => {
                let from = (*from).min(self.text.len());
                let to = (*to).min(self.text.len());
                if from < to {
                    self.marks.push(MarkSpan {
                        from,
                        to,
                        mark: mark.clone(),
                    });
                }
            }
            StepKind::ClearFormat { from, to, mark } => {
                self.marks
                    .retain(|s| !(s.from == *from && s.to == *to && s.mark == *mark));
            }
        }
        self.version += 1;
    }
}

/// Clamp `pos` to the nearest char boundary at or before it.
fn clamp_boundary(text: &str, pos: usize) -> usize {
    let mut pos = pos.min(text.len());
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn map_pos_delete(p: usize, from: usize, to: usize) -> usize {
    if p <= from {
        p
    } else if p >= to {
        p - (to - from)
    } else {
        from
    }
}

/// Transform `step` so it applies after `against` has been applied.
///
/// Returns `None` when the step collapses entirely (its whole range was
/// deleted). Concurrent inserts at the same position are ordered by
/// author id: the smaller author's text lands first on every peer, which
/// is what makes the transform commute.
pub fn transform(step: &Step, against: &Step) -> Option<Step> {
    let kind = match (&step.kind, &against.kind) {
        (kind, StepKind::Insert { pos: i, text }) => {
            let len = text.len();
            match kind {
                StepKind::Insert { pos, text: t } => {
                    let first = i < pos || (i == pos && against.author < step.author);
                    let pos = if first { pos + len } else { *pos };
                    StepKind::Insert {
                        pos,
                        text: t.clone(),
                    }
                }
                StepKind::Delete { from, to } => StepKind::Delete {
                    from: if *i <= *from { from + len } else { *from },
                    to: if *i < *to { to + len } else { *to },
                },
                StepKind::Format { from, to, mark } => StepKind::Format {
                    from: if *i <= *from { from + len } else { *from },
                    to: if *i < *to { to + len } else { *to },
                    mark: mark.clone(),
                },
                StepKind::ClearFormat { from, to, mark } => StepKind::ClearFormat {
                    from: if *i <= *from { from + len } else { *from },
                    to: if *i < *to { to + len } else { *to },
                    mark: mark.clone(),
                },
            }
        }
        (kind, StepKind::Delete { from: df, to: dt }) => match kind {
            StepKind::Insert { pos, text } => {
                // An insert strictly inside the deleted range is
                // swallowed; the mirrored delete transform extends over
                // it, so both application orders agree.
                if *df < *pos && *pos < *dt {
                    return None;
                }
                StepKind::Insert {
                    pos: map_pos_delete(*pos, *df, *dt),
                    text: text.clone(),
                }
            }
            StepKind::Delete { from, to } => {
                let from = map_pos_delete(*from, *df, *dt);
                let to = map_pos_delete(*to, *df, *dt);
                if from >= to {
                    return None;
                }
                StepKind::Delete { from, to }
            }
            StepKind::Format { from, to, mark } => {
                let from = map_pos_delete(*from, *df, *dt);
                let to = map_pos_delete(*to, *df, *dt);
                if from >= to {
                    return None;
                }
                StepKind::Format {
                    from,
                    to,
                    mark: mark.clone(),
                }
            }
            StepKind::ClearFormat { from, to, mark } => {
                let from = map_pos_delete(*from, *df, *dt);
                let to = map_pos_delete(*to, *df, *dt);
                if from >= to {
                    return None;
                }
                StepKind::ClearFormat {
                    from,
                    to,
                    mark: mark.clone(),
                }
            }
        },
        // Formatting moves no text.
        (kind, StepKind::Format { .. }) | (kind, StepKind::ClearFormat { .. }) => kind.clone(),
    };
    Some(Step {
        id: step.id,
        author: step.author,
        base_version: step.base_version,
        kind,
    })
}

/// Result of feeding a remote step to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Foreign step merged into the confirmed document.
    Applied,
    /// Echo of our own step confirmed the oldest pending entry.
    /// `resumed` holds previously suspended steps that may broadcast now.
    Acknowledged { resumed: Vec<Step> },
    /// Step base version is outside the retained history; the engine is
    /// Syncing and a snapshot request carrying `request_id` must go out.
    Resync { request_id: Uuid },
    /// Step was dropped (arrived while syncing, or unmatched ack).
    Dropped,
}

/// Result of applying a snapshot reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotesSnapshotOutcome {
    /// Reply adopted (`replaced` is false when local state already matched).
    Applied { replaced: bool },
    /// Not syncing or wrong request id — late/duplicate reply.
    Ignored,
}

/// Per-document notes engine for one peer.
pub struct NotesEngine {
    local_id: Uuid,
    confirmed: NotesDocument,
    rendered: NotesDocument,
    pending: VecDeque<Step>,
    /// Confirmed steps, oldest first, for transforming laggard remotes.
    history: VecDeque<Step>,
    history_cap: usize,
    max_pending: usize,
    /// pending[..broadcast_cursor] have been broadcast already.
    broadcast_cursor: usize,
    state: SyncState,
}

impl NotesEngine {
    /// Open a document: empty or restored from a persisted snapshot.
    pub fn open(local_id: Uuid, restored: Option<NotesDocument>) -> Self {
        let confirmed = restored.unwrap_or_default();
        Self {
            local_id,
            rendered: confirmed.clone(),
            confirmed,
            pending: VecDeque::new(),
            history: VecDeque::new(),
            history_cap: DEFAULT_HISTORY_CAP,
            max_pending: DEFAULT_PENDING_BOUND,
            broadcast_cursor: 0,
            state: SyncState::Live,
        }
    }

    /// Join an in-progress session; caller broadcasts a snapshot request
    /// carrying the returned id.
    pub fn join(local_id: Uuid) -> (Self, Uuid) {
        let request_id = Uuid::new_v4();
        let mut engine = Self::open(local_id, None);
        engine.state = SyncState::Syncing { request_id };
        (engine, request_id)
    }

    /// Override the pending-queue bound (flow control depth).
    pub fn with_pending_bound(mut self, bound: usize) -> Self {
        self.max_pending = bound;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// The document as the user sees it (confirmed + pending).
    pub fn rendered(&self) -> &NotesDocument {
        &self.rendered
    }

    /// The confirmed shared baseline.
    pub fn confirmed(&self) -> &NotesDocument {
        &self.confirmed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Full confirmed document for snapshot replies and durability.
    pub fn snapshot(&self) -> NotesDocument {
        self.confirmed.clone()
    }

    pub fn can_answer_snapshot(&self) -> bool {
        self.state == SyncState::Live
    }

    /// Author a local edit: apply optimistically to the rendered doc,
    /// enqueue, and return the step to broadcast — or `None` while the
    /// pending queue is over its bound (the edit still renders locally).
    pub fn local_edit(&mut self, kind: StepKind) -> Option<Step> {
        let step = Step {
            id: Uuid::new_v4(),
            author: self.local_id,
            base_version: self.rendered.version,
            kind,
        };
        self.rendered.apply(&step);
        self.pending.push_back(step);
        let mut out = self.drain_broadcastable();
        debug_assert!(out.len() <= 1);
        out.pop()
    }

    /// Feed a remote step (or the echo of one of our own).
    pub fn remote_step(&mut self, step: &Step) -> RemoteOutcome {
        if step.author == self.local_id {
            return self.acknowledge_own(step.id);
        }
        if matches!(self.state, SyncState::Syncing { .. }) {
            // The snapshot reply will cover this edit.
            log::trace!("notes step dropped while syncing");
            return RemoteOutcome::Dropped;
        }

        let vr = step.base_version;
        if vr > self.confirmed.version
            || (self.confirmed.version - vr) as usize > self.history.len()
        {
            let request_id = Uuid::new_v4();
            self.state = SyncState::Syncing { request_id };
            log::debug!(
                "notes step base {} outside retained history (confirmed {}), resyncing",
                vr,
                self.confirmed.version
            );
            return RemoteOutcome::Resync { request_id };
        }

        // Transform through everything confirmed since the step's base...
        let behind = (self.confirmed.version - vr) as usize;
        let mut incoming = step.clone();
        let start = self.history.len() - behind;
        for confirmed in self.history.iter().skip(start) {
            incoming = match transform(&incoming, confirmed) {
                Some(t) => t,
                None => {
                    incoming.kind = StepKind::noop();
                    incoming
                }
            };
        }

        // ...then advance the confirmed baseline and rebase the pending
        // queue against the incoming step, in queue order.
        self.confirmed.apply(&incoming);
        self.push_history(incoming.clone());

        let mut against = incoming;
        for local in self.pending.iter_mut() {
            let rebased = transform(local, &against);
            let advanced = transform(&against, local);
            if let Some(a) = advanced {
                against = a;
            } else {
                against.kind = StepKind::noop();
            }
            match rebased {
                Some(r) => local.kind = r.kind,
                None => local.kind = StepKind::noop(),
            }
        }
        self.rebuild_rendered();
        RemoteOutcome::Applied
    }

    /// Apply a snapshot reply; first valid reply wins, anything later is
    /// ignored. Adopting a snapshot identical to the confirmed document
    /// is a pure state transition (no version bump, no rebase).
    pub fn apply_snapshot_reply(
        &mut self,
        request_id: Uuid,
        snapshot: &NotesDocument,
    ) -> NotesSnapshotOutcome {
        match self.state {
            SyncState::Syncing { request_id: want } if want == request_id => {}
            _ => return NotesSnapshotOutcome::Ignored,
        }
        self.state = SyncState::Live;
        if *snapshot == self.confirmed {
            return NotesSnapshotOutcome::Applied { replaced: false };
        }

        self.confirmed = snapshot.clone();
        self.history.clear();
        for (i, p) in self.pending.iter_mut().enumerate() {
            p.base_version = self.confirmed.version + i as u64;
        }
        self.rebuild_rendered();
        log::debug!("notes resynced to version {}", self.confirmed.version);
        NotesSnapshotOutcome::Applied { replaced: true }
    }

    fn acknowledge_own(&mut self, step_id: Uuid) -> RemoteOutcome {
        match self.pending.front() {
            Some(front) if front.id == step_id => {}
            _ => {
                // Ack for a step discarded during a resync — harmless.
                log::trace!("unmatched ack for step {step_id}");
                return RemoteOutcome::Dropped;
            }
        }
        let step = self.pending.pop_front().expect("front checked above");
        self.confirmed.apply(&step);
        self.push_history(step);
        if self.broadcast_cursor > 0 {
            self.broadcast_cursor -= 1;
        }
        let resumed = self.drain_broadcastable();
        RemoteOutcome::Acknowledged { resumed }
    }

    /// Advance the broadcast cursor over any pending steps that may go
    /// out now, returning them with up-to-date base versions.
    fn drain_broadcastable(&mut self) -> Vec<Step> {
        let mut out = Vec::new();
        while self.broadcast_cursor < self.pending.len() && self.broadcast_cursor < self.max_pending
        {
            let mut step = self.pending[self.broadcast_cursor].clone();
            step.base_version = self.confirmed.version + self.broadcast_cursor as u64;
            self.pending[self.broadcast_cursor].base_version = step.base_version;
            self.broadcast_cursor += 1;
            out.push(step);
        }
        out
    }

    fn push_history(&mut self, step: Step) {
        self.history.push_back(step);
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }
    }

    fn rebuild_rendered(&mut self) {
        let mut rendered = self.confirmed.clone();
        for p in &self.pending {
            rendered.apply(p);
        }
        self.rendered = rendered;
    }
}
