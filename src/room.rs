//! Per-room event scheduler.
//!
//! One room, one logical event queue:
//! ```text
//! transport inbound ──┐
//! local edits ────────┤
//! heartbeat tick ─────┼──► RoomEngine::process ──► engines + permissions
//! snapshot tick ──────┤         │
//! shutdown ───────────┘         └──► broadcasts / notices
//! ```
//!
//! Events are processed one at a time to completion, so no sync engine
//! ever observes another mid-mutation; the only suspension points are
//! at the transport boundary. Inbound frames pass through a per-sender
//! [`SequenceTracker`] first, which drops stale duplicates and briefly
//! buffers out-of-order frames before handing the rest to the engines
//! (document-level gap detection takes over from there).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::notes::{NotesEngine, RemoteOutcome, StepKind};
use crate::permissions::{LockDecision, LockTarget, PermissionConfig, PermissionModel, Role};
use crate::protocol::{SyncBody, SyncMessage};
use crate::snapshot::{SnapshotConfig, SnapshotManager};
use crate::storage::{DocumentKind, SnapshotStore};
use crate::transport::{send_with_retry, Delivery, Destination, RetryPolicy, Transport};
use crate::whiteboard::{ApplyOutcome, RecordKind, SnapshotOutcome, WhiteboardEngine};

/// Room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub heartbeat_interval: Duration,
    /// A participant silent for longer than this is disconnected.
    pub heartbeat_timeout: Duration,
    pub lock_ttl: Duration,
    pub snapshot_interval: Duration,
    /// Bound on unconfirmed local notes steps.
    pub pending_bound: usize,
    /// Out-of-order frames buffered per sender before giving up.
    pub reorder_window: usize,
    pub retry: RetryPolicy,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            lock_ttl: Duration::from_secs(30),
            snapshot_interval: Duration::from_secs(30),
            pending_bound: crate::notes::DEFAULT_PENDING_BOUND,
            reorder_window: 16,
            retry: RetryPolicy::default(),
        }
    }
}

/// Events fed to [`RoomEngine::process`].
#[derive(Debug)]
pub enum RoomEvent {
    /// A frame from the transport.
    Frame { from: Uuid, bytes: Vec<u8> },
    /// The local user changed a whiteboard record.
    WhiteboardEdit {
        id: Uuid,
        kind: RecordKind,
        attrs: Vec<u8>,
    },
    /// The local user edited the notes document.
    NotesEdit(StepKind),
    /// The local user claims or releases a lock.
    Lock { target: LockTarget, release: bool },
    /// The local host changes a participant's role.
    SetRole { participant: Uuid, role: Role },
    /// Roster change from the meeting's signaling layer.
    ParticipantJoined {
        id: Uuid,
        name: String,
        avatar_url: Option<String>,
    },
    ParticipantLeft(Uuid),
    HeartbeatTick,
    SnapshotTick,
    Shutdown,
}

/// UI-facing notices. None of these are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomNotice {
    /// A lock request was denied or an edit hit someone else's lock.
    LockDenied,
    /// A document fell behind and is fetching a snapshot.
    Resyncing,
    /// The transport is failing; edits continue locally.
    Reconnecting,
}

/// Per-sender sequence tracking: non-decreasing delivery, stale drops,
/// bounded reorder buffering.
pub struct SequenceTracker {
    next: Option<u64>,
    buffer: BTreeMap<u64, SyncMessage>,
    window: usize,
    stale_dropped: u64,
}

impl SequenceTracker {
    pub fn new(window: usize) -> Self {
        Self {
            next: None,
            buffer: BTreeMap::new(),
            window,
            stale_dropped: 0,
        }
    }

    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    /// Feed one frame; returns frames ready for delivery, in order.
    ///
    /// The first frame from a sender fixes the baseline. A frame below
    /// the expected sequence is a duplicate and is dropped. A frame
    /// ahead of it waits in the reorder buffer; once the buffer
    /// overflows the window we stop waiting for the missing frames and
    /// flush in order (the engines resync off their own gap checks).
    pub fn observe(&mut self, msg: SyncMessage) -> Vec<SyncMessage> {
        let seq = msg.seq;
        let next = match self.next {
            None => {
                self.next = Some(seq + 1);
                return vec![msg];
            }
            Some(n) => n,
        };

        if seq < next {
            self.stale_dropped += 1;
            log::trace!("stale frame seq {seq} from {} dropped", msg.sender);
            return Vec::new();
        }

        if seq == next {
            let mut out = vec![msg];
            let mut expect = next + 1;
            while let Some(buffered) = self.buffer.remove(&expect) {
                out.push(buffered);
                expect += 1;
            }
            self.next = Some(expect);
            return out;
        }

        self.buffer.insert(seq, msg);
        if self.buffer.len() > self.window {
            let drained = std::mem::take(&mut self.buffer);
            let last = *drained.keys().next_back().unwrap_or(&seq);
            self.next = Some(last + 1);
            log::debug!("reorder window exceeded, flushing {} frames", drained.len());
            return drained.into_values().collect();
        }
        Vec::new()
    }
}

/// Everything one peer runs for one room.
pub struct RoomEngine<T: Transport, S: SnapshotStore> {
    local_id: Uuid,
    config: RoomConfig,
    transport: T,
    permissions: PermissionModel,
    whiteboard: WhiteboardEngine,
    notes: NotesEngine,
    snapshots: SnapshotManager<S>,
    trackers: HashMap<Uuid, SequenceTracker>,
    out_seq: u64,
}

impl<T: Transport, S: SnapshotStore> RoomEngine<T, S> {
    /// Open a room fresh or from persisted state. The local engines
    /// start Live; peers arriving later sync from us.
    pub fn open(local_id: Uuid, room: Uuid, transport: T, store: S, config: RoomConfig) -> Self {
        let snapshots = SnapshotManager::new(store, room, SnapshotConfig {
            flush_interval: config.snapshot_interval,
        });
        let restored = snapshots.restore();
        let whiteboard = WhiteboardEngine::open(local_id, restored.whiteboard);
        let notes =
            NotesEngine::open(local_id, restored.notes).with_pending_bound(config.pending_bound);
        let permissions = PermissionModel::new(PermissionConfig {
            lock_ttl: config.lock_ttl,
            heartbeat_timeout: config.heartbeat_timeout,
        });
        Self {
            local_id,
            config,
            transport,
            permissions,
            whiteboard,
            notes,
            snapshots,
            trackers: HashMap::new(),
            out_seq: 0,
        }
    }

    /// Join an in-progress session: both engines start Syncing and the
    /// snapshot requests go out immediately.
    pub async fn join(
        local_id: Uuid,
        room: Uuid,
        transport: T,
        store: S,
        config: RoomConfig,
    ) -> Self {
        let mut engine = Self::open(local_id, room, transport, store, config);
        let (wb, wb_request) = WhiteboardEngine::join(local_id);
        let (nt, nt_request) = NotesEngine::join(local_id);
        engine.whiteboard = wb;
        engine.notes = nt.with_pending_bound(engine.config.pending_bound);
        engine
            .broadcast(SyncBody::WhiteboardSnapshotRequest {
                request_id: wb_request,
            })
            .await;
        engine
            .broadcast(SyncBody::NotesSnapshotRequest {
                request_id: nt_request,
            })
            .await;
        engine
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn whiteboard(&self) -> &WhiteboardEngine {
        &self.whiteboard
    }

    pub fn notes(&self) -> &NotesEngine {
        &self.notes
    }

    pub fn permissions(&self) -> &PermissionModel {
        &self.permissions
    }

    /// Drive the room from its input channels until shutdown.
    ///
    /// `commands` carries local edits and roster changes, `inbound` the
    /// transport frames. Notices are forwarded to the UI channel.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<(Uuid, Vec<u8>)>,
        mut commands: mpsc::Receiver<RoomEvent>,
        notices: mpsc::Sender<RoomNotice>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut snapshot = tokio::time::interval(self.config.snapshot_interval);

        loop {
            let event = tokio::select! {
                frame = inbound.recv() => match frame {
                    Some((from, bytes)) => RoomEvent::Frame { from, bytes },
                    None => RoomEvent::Shutdown,
                },
                cmd = commands.recv() => match cmd {
                    Some(event) => event,
                    None => RoomEvent::Shutdown,
                },
                _ = heartbeat.tick() => RoomEvent::HeartbeatTick,
                _ = snapshot.tick() => RoomEvent::SnapshotTick,
            };

            let shutdown = matches!(event, RoomEvent::Shutdown);
            for notice in self.process(event).await {
                let _ = notices.send(notice).await;
            }
            if shutdown {
                break;
            }
        }
    }

    /// Process one event to completion.
    pub async fn process(&mut self, event: RoomEvent) -> Vec<RoomNotice> {
        let mut notices = Vec::new();
        match event {
            RoomEvent::Frame { from, bytes } => {
                let msg = match SyncMessage::decode(&bytes) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("dropping frame from {from}: {e}");
                        return notices;
                    }
                };
                let ready = self
                    .trackers
                    .entry(msg.sender)
                    .or_insert_with(|| SequenceTracker::new(self.config.reorder_window))
                    .observe(msg);
                for msg in ready {
                    self.route(msg, &mut notices).await;
                }
            }
            RoomEvent::WhiteboardEdit { id, kind, attrs } => {
                self.local_whiteboard_edit(id, kind, attrs, &mut notices).await;
            }
            RoomEvent::NotesEdit(kind) => {
                self.local_notes_edit(kind, &mut notices).await;
            }
            RoomEvent::Lock { target, release } => {
                // Applied when the echo comes back, so every peer sees
                // lock requests in the same total order.
                self.broadcast(SyncBody::LockRequest { target, release }).await;
            }
            RoomEvent::SetRole { participant, role } => {
                self.broadcast(SyncBody::RoleChange { participant, role }).await;
            }
            RoomEvent::ParticipantJoined { id, name, avatar_url } => {
                self.permissions.join(id, name, avatar_url);
                if id == self.local_id {
                    self.permissions.mark_active(id);
                }
            }
            RoomEvent::ParticipantLeft(id) => {
                let promoted = self.permissions.leave(id);
                self.announce_local_grants(&promoted).await;
                self.trackers.remove(&id);
            }
            RoomEvent::HeartbeatTick => {
                self.broadcast_with(SyncBody::Heartbeat, Delivery::BestEffort).await;
                let promoted = self.permissions.expire(Instant::now());
                self.announce_local_grants(&promoted).await;
            }
            RoomEvent::SnapshotTick => {
                let report = self
                    .snapshots
                    .tick(self.whiteboard.doc(), self.notes.confirmed());
                if report.failed > 0 {
                    log::warn!("{} snapshot flush(es) failed, retrying next tick", report.failed);
                }
            }
            RoomEvent::Shutdown => {
                self.snapshots
                    .session_end(self.whiteboard.doc(), self.notes.confirmed());
            }
        }
        notices
    }

    async fn route(&mut self, msg: SyncMessage, notices: &mut Vec<RoomNotice>) {
        let sender = msg.sender;
        match msg.body {
            SyncBody::WhiteboardPatch(patch) => {
                // Our own patch was applied at edit time.
                if sender == self.local_id {
                    return;
                }
                match self.whiteboard.apply_remote(&patch) {
                    ApplyOutcome::Applied { changed } => {
                        if changed > 0 {
                            self.snapshots.mark_dirty(DocumentKind::Whiteboard);
                        }
                    }
                    ApplyOutcome::Gap { request_id } => {
                        // The patch's records were merged even though the
                        // engine went Syncing.
                        self.snapshots.mark_dirty(DocumentKind::Whiteboard);
                        notices.push(RoomNotice::Resyncing);
                        self.broadcast(SyncBody::WhiteboardSnapshotRequest { request_id })
                            .await;
                    }
                }
            }
            SyncBody::WhiteboardSnapshotRequest { request_id } => {
                if sender != self.local_id && self.whiteboard.can_answer_snapshot() {
                    self.send_to(
                        sender,
                        SyncBody::WhiteboardSnapshotReply {
                            request_id,
                            snapshot: self.whiteboard.snapshot(),
                        },
                    )
                    .await;
                }
            }
            SyncBody::WhiteboardSnapshotReply { request_id, snapshot } => {
                if let SnapshotOutcome::Applied { .. } =
                    self.whiteboard.apply_snapshot_reply(request_id, &snapshot)
                {
                    self.snapshots.mark_dirty(DocumentKind::Whiteboard);
                }
            }
            SyncBody::NotesStep(step) => match self.notes.remote_step(&step) {
                RemoteOutcome::Applied => {
                    self.snapshots.mark_dirty(DocumentKind::Notes);
                }
                RemoteOutcome::Acknowledged { resumed } => {
                    self.snapshots.mark_dirty(DocumentKind::Notes);
                    for step in resumed {
                        self.broadcast(SyncBody::NotesStep(step)).await;
                    }
                }
                RemoteOutcome::Resync { request_id } => {
                    notices.push(RoomNotice::Resyncing);
                    self.broadcast(SyncBody::NotesSnapshotRequest { request_id })
                        .await;
                }
                RemoteOutcome::Dropped => {}
            },
            SyncBody::NotesSnapshotRequest { request_id } => {
                if sender != self.local_id && self.notes.can_answer_snapshot() {
                    self.send_to(
                        sender,
                        SyncBody::NotesSnapshotReply {
                            request_id,
                            snapshot: self.notes.snapshot(),
                        },
                    )
                    .await;
                }
            }
            SyncBody::NotesSnapshotReply { request_id, snapshot } => {
                use crate::notes::NotesSnapshotOutcome;
                if let NotesSnapshotOutcome::Applied { replaced: true } =
                    self.notes.apply_snapshot_reply(request_id, &snapshot)
                {
                    self.snapshots.mark_dirty(DocumentKind::Notes);
                }
            }
            SyncBody::RoleChange { participant, role } => {
                if let Err(e) = self.permissions.set_role(sender, participant, role) {
                    log::warn!("role change rejected: {e}");
                }
            }
            SyncBody::LockRequest { target, release } => {
                let now = Instant::now();
                if release {
                    let promoted = self.permissions.release_lock(sender, &target, now);
                    self.announce_local_grants(&promoted).await;
                } else {
                    match self.permissions.request_lock(sender, target.clone(), now) {
                        LockDecision::Granted if sender == self.local_id => {
                            let ttl_ms = self.config.lock_ttl.as_millis() as u64;
                            self.broadcast(SyncBody::LockGrant {
                                holder: sender,
                                target,
                                ttl_ms,
                            })
                            .await;
                        }
                        LockDecision::Denied if sender == self.local_id => {
                            notices.push(RoomNotice::LockDenied);
                        }
                        _ => {}
                    }
                }
            }
            SyncBody::LockGrant { holder, target, ttl_ms: _ } => {
                self.permissions.apply_grant(holder, target, Instant::now());
            }
            SyncBody::Heartbeat => {
                if sender != self.local_id {
                    self.permissions.heartbeat(sender, Instant::now());
                }
            }
        }
    }

    async fn local_whiteboard_edit(
        &mut self,
        id: Uuid,
        kind: RecordKind,
        attrs: Vec<u8>,
        notices: &mut Vec<RoomNotice>,
    ) {
        let records: BTreeSet<Uuid> = [id].into_iter().collect();
        if !self.permissions.can_edit_records(&self.local_id, &records) {
            notices.push(RoomNotice::LockDenied);
            return;
        }
        let patch = self.whiteboard.upsert_local(id, kind, attrs);
        self.snapshots.mark_dirty(DocumentKind::Whiteboard);
        if !self.broadcast(SyncBody::WhiteboardPatch(patch)).await {
            notices.push(RoomNotice::Reconnecting);
        }
    }

    async fn local_notes_edit(&mut self, kind: StepKind, notices: &mut Vec<RoomNotice>) {
        if !self.permissions.can_edit_notes(&self.local_id) {
            notices.push(RoomNotice::LockDenied);
            return;
        }
        // The edit always renders; only the broadcast may be withheld.
        if let Some(step) = self.notes.local_edit(kind) {
            if !self.broadcast(SyncBody::NotesStep(step)).await {
                notices.push(RoomNotice::Reconnecting);
            }
        } else {
            log::debug!("notes broadcast suspended at {} pending steps", self.notes.pending_len());
        }
    }

    /// Broadcast LockGrant for promotions where we are the new holder.
    async fn announce_local_grants(&mut self, promoted: &[(Uuid, LockTarget)]) {
        let ttl_ms = self.config.lock_ttl.as_millis() as u64;
        for (holder, target) in promoted {
            if *holder == self.local_id {
                self.broadcast(SyncBody::LockGrant {
                    holder: *holder,
                    target: target.clone(),
                    ttl_ms,
                })
                .await;
            }
        }
    }

    async fn broadcast(&mut self, body: SyncBody) -> bool {
        self.broadcast_with(body, Delivery::Reliable).await
    }

    async fn broadcast_with(&mut self, body: SyncBody, delivery: Delivery) -> bool {
        self.out_seq += 1;
        let msg = SyncMessage::new(self.local_id, self.out_seq, body);
        let bytes = match msg.encode() {
            Ok(b) => b,
            Err(e) => {
                log::error!("encode failed for {:?}: {e}", msg.kind());
                return false;
            }
        };
        let result = match delivery {
            Delivery::Reliable => {
                send_with_retry(&self.transport, bytes, Destination::All, self.config.retry).await
            }
            Delivery::BestEffort => {
                self.transport
                    .send(bytes, Destination::All, Delivery::BestEffort)
                    .await
            }
        };
        if let Err(e) = result {
            log::warn!("broadcast of {:?} failed: {e}", msg.kind());
            return false;
        }
        true
    }

    async fn send_to(&mut self, peer: Uuid, body: SyncBody) {
        self.out_seq += 1;
        let msg = SyncMessage::new(self.local_id, self.out_seq, body);
        let bytes = match msg.encode() {
            Ok(b) => b,
            Err(e) => {
                log::error!("encode failed for {:?}: {e}", msg.kind());
                return;
            }
        };
        let dest = Destination::Peers(HashSet::from([peer]));
        if let Err(e) = send_with_retry(&self.transport, bytes, dest, self.config.retry).await {
            log::warn!("send of {:?} to {peer} failed: {e}", msg.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySnapshotStore;
    use crate::transport::LocalHub;
    use crate::whiteboard::SyncState;

    fn message(sender: Uuid, seq: u64) -> SyncMessage {
        SyncMessage::new(sender, seq, SyncBody::Heartbeat)
    }

    // ── sequence tracker ────────────────────────────────────────────

    #[test]
    fn test_tracker_in_order_delivery() {
        let sender = Uuid::new_v4();
        let mut tracker = SequenceTracker::new(4);
        for seq in 1..=3 {
            let out = tracker.observe(message(sender, seq));
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].seq, seq);
        }
    }

    #[test]
    fn test_tracker_drops_stale_duplicate() {
        let sender = Uuid::new_v4();
        let mut tracker = SequenceTracker::new(4);
        tracker.observe(message(sender, 1));
        tracker.observe(message(sender, 2));

        assert!(tracker.observe(message(sender, 1)).is_empty());
        assert!(tracker.observe(message(sender, 2)).is_empty());
        assert_eq!(tracker.stale_dropped(), 2);
    }

    #[test]
    fn test_tracker_reorders_within_window() {
        let sender = Uuid::new_v4();
        let mut tracker = SequenceTracker::new(4);
        tracker.observe(message(sender, 1));

        // 3 arrives before 2: held, then both delivered in order.
        assert!(tracker.observe(message(sender, 3)).is_empty());
        let out = tracker.observe(message(sender, 2));
        assert_eq!(out.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_tracker_flushes_past_window() {
        let sender = Uuid::new_v4();
        let mut tracker = SequenceTracker::new(2);
        tracker.observe(message(sender, 1));

        // Frame 2 never arrives; 3,4,5 overflow the window.
        assert!(tracker.observe(message(sender, 3)).is_empty());
        assert!(tracker.observe(message(sender, 4)).is_empty());
        let out = tracker.observe(message(sender, 5));
        assert_eq!(out.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![3, 4, 5]);

        // Delivery resumes after the flushed frames.
        let out = tracker.observe(message(sender, 6));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_tracker_first_frame_fixes_baseline() {
        let sender = Uuid::new_v4();
        let mut tracker = SequenceTracker::new(4);
        // A peer that joined late first hears seq 40.
        assert_eq!(tracker.observe(message(sender, 40)).len(), 1);
        assert_eq!(tracker.observe(message(sender, 41)).len(), 1);
        assert!(tracker.observe(message(sender, 40)).is_empty());
    }

    // ── room engine ─────────────────────────────────────────────────

    struct Peer {
        engine: RoomEngine<crate::transport::LocalEndpoint, MemorySnapshotStore>,
        rx: mpsc::Receiver<(Uuid, Vec<u8>)>,
    }

    fn spawn_peer(hub: &LocalHub, room: Uuid) -> Peer {
        let id = Uuid::new_v4();
        let (endpoint, rx) = hub.register(id);
        let engine = RoomEngine::open(
            id,
            room,
            endpoint,
            MemorySnapshotStore::new(),
            RoomConfig::default(),
        );
        Peer { engine, rx }
    }

    /// Feed every peer the same roster in the same order, the way the
    /// meeting's signaling layer would.
    async fn join_roster(peers: &mut [Peer]) {
        let ids: Vec<Uuid> = peers.iter().map(|p| p.engine.local_id()).collect();
        for peer in peers.iter_mut() {
            for &id in &ids {
                peer.engine
                    .process(RoomEvent::ParticipantJoined {
                        id,
                        name: "peer".into(),
                        avatar_url: None,
                    })
                    .await;
            }
        }
    }

    /// Deliver every queued frame to every peer until quiescent.
    async fn pump(peers: &mut [Peer]) {
        loop {
            let mut delivered = false;
            for i in 0..peers.len() {
                while let Ok((from, bytes)) = peers[i].rx.try_recv() {
                    peers[i]
                        .engine
                        .process(RoomEvent::Frame { from, bytes })
                        .await;
                    delivered = true;
                }
            }
            if !delivered {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_whiteboard_edit_propagates() {
        let hub = LocalHub::new();
        let room = Uuid::new_v4();
        let a = spawn_peer(&hub, room);
        let b = spawn_peer(&hub, room);
        let mut peers = [a, b];
        join_roster(&mut peers).await;

        let record = Uuid::new_v4();
        peers[0]
            .engine
            .process(RoomEvent::WhiteboardEdit {
                id: record,
                kind: RecordKind::Shape,
                attrs: b"rect".to_vec(),
            })
            .await;
        pump(&mut peers).await;

        assert_eq!(
            peers[0].engine.whiteboard().doc().records,
            peers[1].engine.whiteboard().doc().records
        );
        assert_eq!(
            peers[1].engine.whiteboard().doc().get(&record).unwrap().attrs,
            b"rect"
        );
    }

    #[tokio::test]
    async fn test_notes_edits_converge_through_relay_order() {
        let hub = LocalHub::new();
        let room = Uuid::new_v4();
        let a = spawn_peer(&hub, room);
        let b = spawn_peer(&hub, room);
        let mut peers = [a, b];
        join_roster(&mut peers).await;

        // Seed both peers with the same baseline document.
        peers[0]
            .engine
            .process(RoomEvent::NotesEdit(StepKind::Insert {
                pos: 0,
                text: "abcdef".into(),
            }))
            .await;
        pump(&mut peers).await;

        peers[0]
            .engine
            .process(RoomEvent::NotesEdit(StepKind::Insert {
                pos: 3,
                text: "X".into(),
            }))
            .await;
        peers[1]
            .engine
            .process(RoomEvent::NotesEdit(StepKind::Delete { from: 0, to: 3 }))
            .await;
        pump(&mut peers).await;

        let a_text = &peers[0].engine.notes().confirmed().text;
        let b_text = &peers[1].engine.notes().confirmed().text;
        assert_eq!(a_text, b_text);
        assert_eq!(peers[0].engine.notes().pending_len(), 0);
        assert_eq!(peers[1].engine.notes().pending_len(), 0);
    }

    #[tokio::test]
    async fn test_late_joiner_syncs_via_snapshot() {
        let hub = LocalHub::new();
        let room = Uuid::new_v4();
        let a = spawn_peer(&hub, room);
        let mut solo = [a];
        join_roster(&mut solo).await;
        let [mut a] = solo;

        for i in 0..3u8 {
            a.engine
                .process(RoomEvent::WhiteboardEdit {
                    id: Uuid::new_v4(),
                    kind: RecordKind::Shape,
                    attrs: vec![i],
                })
                .await;
        }
        // Drain a's own echoes before the newcomer arrives.
        let mut solo = [a];
        pump(&mut solo).await;
        let [a] = solo;

        let c_id = Uuid::new_v4();
        let (endpoint, rx) = hub.register(c_id);
        let engine = RoomEngine::join(
            c_id,
            room,
            endpoint,
            MemorySnapshotStore::new(),
            RoomConfig::default(),
        )
        .await;
        let c = Peer { engine, rx };
        assert!(matches!(c.engine.whiteboard().state(), SyncState::Syncing { .. }));

        let mut peers = [a, c];
        pump(&mut peers).await;

        assert_eq!(peers[1].engine.whiteboard().state(), SyncState::Live);
        assert_eq!(
            peers[0].engine.whiteboard().doc().records,
            peers[1].engine.whiteboard().doc().records
        );
    }

    #[tokio::test]
    async fn test_lock_denied_notice_for_second_claimant() {
        let hub = LocalHub::new();
        let room = Uuid::new_v4();
        let a = spawn_peer(&hub, room);
        let b = spawn_peer(&hub, room);
        let a_id = a.engine.local_id();
        let mut peers = [a, b];
        join_roster(&mut peers).await;
        pump(&mut peers).await;

        peers[0]
            .engine
            .process(RoomEvent::Lock {
                target: LockTarget::Notes,
                release: false,
            })
            .await;
        pump(&mut peers).await;
        assert!(peers[0]
            .engine
            .permissions()
            .holds_lock(&a_id, &LockTarget::Notes));

        // The other peer now edits against the held lock.
        let mut notices = Vec::new();
        peers[1]
            .engine
            .local_notes_edit(
                StepKind::Insert {
                    pos: 0,
                    text: "x".into(),
                },
                &mut notices,
            )
            .await;
        assert_eq!(notices, vec![RoomNotice::LockDenied]);
    }

    #[tokio::test]
    async fn test_shutdown_persists_state() {
        let hub = LocalHub::new();
        let room = Uuid::new_v4();
        let a = spawn_peer(&hub, room);
        let mut solo = [a];
        join_roster(&mut solo).await;
        let [mut a] = solo;

        a.engine
            .process(RoomEvent::WhiteboardEdit {
                id: Uuid::new_v4(),
                kind: RecordKind::Page,
                attrs: b"p1".to_vec(),
            })
            .await;
        let doc = a.engine.whiteboard().snapshot();
        a.engine.process(RoomEvent::Shutdown).await;

        let restored = a.engine.snapshots.restore();
        assert_eq!(restored.whiteboard.unwrap(), doc);
    }
}
