//! Participant roles and the advisory lock model.
//!
//! Tracks who is in the room, their role, and the active lock set that
//! both document engines consult before accepting local edits. Locks are
//! advisory — they prevent simultaneous-edit collisions in typical use,
//! but the LWW/OT rules converge even if two peers edit without holding
//! one (lock-expiry races are harmless).
//!
//! Policy:
//! - The host always has edit rights and may revoke any lock.
//! - Participants need either no conflicting lock or their own.
//! - Queued lock requests are granted first-come-first-served when the
//!   current lock is released or expires.
//! - Locks expire after a TTL (default 30s) and are renewed by
//!   heartbeats; a run of missed heartbeats force-releases everything
//!   the silent participant holds.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default lock time-to-live.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Host,
    Participant,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Joining,
    Active,
    Disconnected,
}

/// A room member. Identity and display metadata come from the auth
/// provider and are treated as opaque, already verified.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
    pub role: Role,
    pub connection: ConnectionState,
    pub last_heartbeat: Option<Instant>,
}

/// What a lock covers: the whole notes document, or a subset of
/// whiteboard records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockTarget {
    Notes,
    WhiteboardRecords(BTreeSet<Uuid>),
}

impl LockTarget {
    /// Two targets conflict when they cover overlapping state.
    pub fn conflicts_with(&self, other: &LockTarget) -> bool {
        match (self, other) {
            (LockTarget::Notes, LockTarget::Notes) => true,
            (LockTarget::WhiteboardRecords(a), LockTarget::WhiteboardRecords(b)) => {
                !a.is_disjoint(b)
            }
            _ => false,
        }
    }
}

/// An exclusive claim over a target, held until release, expiry, or the
/// holder's disconnect.
#[derive(Debug, Clone)]
pub struct Lock {
    pub holder: Uuid,
    pub target: LockTarget,
    pub expires_at: Instant,
}

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
    Granted,
    Denied,
    Queued,
}

/// Permission model errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionError {
    /// Only the host may perform this operation.
    NotHost(Uuid),
    /// Unknown participant id.
    UnknownParticipant(Uuid),
}

impl std::fmt::Display for PermissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionError::NotHost(id) => write!(f, "participant {id} is not the host"),
            PermissionError::UnknownParticipant(id) => write!(f, "unknown participant {id}"),
        }
    }
}

impl std::error::Error for PermissionError {}

/// Configuration for lock TTL and heartbeat liveness.
#[derive(Debug, Clone)]
pub struct PermissionConfig {
    pub lock_ttl: Duration,
    /// A participant silent for longer than this is disconnected and
    /// its locks force-released.
    pub heartbeat_timeout: Duration,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

/// Tracks participants, roles, and the active lock set for one room.
pub struct PermissionModel {
    config: PermissionConfig,
    participants: HashMap<Uuid, Participant>,
    locks: Vec<Lock>,
    /// FCFS queue of deferred lock requests.
    queue: VecDeque<(Uuid, LockTarget)>,
}

impl PermissionModel {
    pub fn new(config: PermissionConfig) -> Self {
        Self {
            config,
            participants: HashMap::new(),
            locks: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PermissionConfig::default())
    }

    // ── participants ────────────────────────────────────────────────

    /// Register a participant on room-join notification. The first
    /// member to join becomes the host.
    pub fn join(&mut self, id: Uuid, name: impl Into<String>, avatar_url: Option<String>) {
        let role = if self.participants.values().any(|p| p.role == Role::Host) {
            Role::Participant
        } else {
            Role::Host
        };
        let name = name.into();
        log::info!("participant {name} ({id}) joined as {role:?}");
        self.participants.insert(
            id,
            Participant {
                id,
                name,
                avatar_url,
                role,
                connection: ConnectionState::Joining,
                last_heartbeat: None,
            },
        );
    }

    /// Mark a joining participant as fully synced and active.
    pub fn mark_active(&mut self, id: Uuid) {
        if let Some(p) = self.participants.get_mut(&id) {
            p.connection = ConnectionState::Active;
        }
    }

    /// Remove a participant and force-release everything it holds.
    pub fn leave(&mut self, id: Uuid) -> Vec<(Uuid, LockTarget)> {
        if self.participants.remove(&id).is_some() {
            log::info!("participant {id} left");
        }
        self.queue.retain(|(holder, _)| *holder != id);
        self.release_all_for(id, Instant::now())
    }

    pub fn participant(&self, id: &Uuid) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn role(&self, id: &Uuid) -> Option<Role> {
        self.participants.get(id).map(|p| p.role)
    }

    /// Change a participant's role. Host-only.
    pub fn set_role(&mut self, actor: Uuid, target: Uuid, role: Role) -> Result<(), PermissionError> {
        if self.role(&actor) != Some(Role::Host) {
            return Err(PermissionError::NotHost(actor));
        }
        let p = self
            .participants
            .get_mut(&target)
            .ok_or(PermissionError::UnknownParticipant(target))?;
        p.role = role;
        log::info!("role of {target} changed to {role:?}");
        Ok(())
    }

    // ── edit rights ─────────────────────────────────────────────────

    /// May this participant edit the whiteboard at all? Record-level
    /// conflicts are checked separately via [`can_edit_records`].
    ///
    /// [`can_edit_records`]: PermissionModel::can_edit_records
    pub fn can_edit_whiteboard(&self, id: &Uuid) -> bool {
        match self.participants.get(id) {
            Some(p) if p.role == Role::Host => true,
            Some(p) => p.connection == ConnectionState::Active,
            None => false,
        }
    }

    /// May this participant edit the given whiteboard records?
    pub fn can_edit_records(&self, id: &Uuid, records: &BTreeSet<Uuid>) -> bool {
        if !self.can_edit_whiteboard(id) {
            return false;
        }
        if self.role(id) == Some(Role::Host) {
            return true;
        }
        let target = LockTarget::WhiteboardRecords(records.clone());
        !self
            .locks
            .iter()
            .any(|l| l.holder != *id && l.target.conflicts_with(&target))
    }

    /// May this participant edit the notes document?
    pub fn can_edit_notes(&self, id: &Uuid) -> bool {
        match self.participants.get(id) {
            Some(p) if p.role == Role::Host => true,
            Some(p) if p.connection == ConnectionState::Active => !self
                .locks
                .iter()
                .any(|l| l.holder != *id && l.target.conflicts_with(&LockTarget::Notes)),
            _ => false,
        }
    }

    // ── locks ───────────────────────────────────────────────────────

    pub fn locks(&self) -> &[Lock] {
        &self.locks
    }

    pub fn holds_lock(&self, id: &Uuid, target: &LockTarget) -> bool {
        self.locks
            .iter()
            .any(|l| l.holder == *id && l.target == *target)
    }

    /// Request an exclusive lock. Conflicting active locks queue the
    /// request (FCFS); unknown or disconnected participants are denied.
    pub fn request_lock(&mut self, id: Uuid, target: LockTarget, now: Instant) -> LockDecision {
        match self.participants.get(&id) {
            Some(p) if p.connection != ConnectionState::Disconnected => {}
            _ => return LockDecision::Denied,
        }
        if self.holds_lock(&id, &target) {
            // Re-request renews.
            self.renew_locks(id, now);
            return LockDecision::Granted;
        }
        if self
            .locks
            .iter()
            .any(|l| l.holder != id && l.target.conflicts_with(&target))
        {
            log::debug!("lock on {target:?} queued for {id}");
            self.queue.push_back((id, target));
            return LockDecision::Queued;
        }
        self.locks.push(Lock {
            holder: id,
            target,
            expires_at: now + self.config.lock_ttl,
        });
        LockDecision::Granted
    }

    /// Release a held lock and promote queued requests. Returns the
    /// grants that resulted from promotion.
    pub fn release_lock(
        &mut self,
        id: Uuid,
        target: &LockTarget,
        now: Instant,
    ) -> Vec<(Uuid, LockTarget)> {
        self.locks
            .retain(|l| !(l.holder == id && l.target == *target));
        self.promote_queue(now)
    }

    /// Host override: drop any lock conflicting with `target`.
    pub fn revoke_lock(
        &mut self,
        actor: Uuid,
        target: &LockTarget,
        now: Instant,
    ) -> Result<Vec<(Uuid, LockTarget)>, PermissionError> {
        if self.role(&actor) != Some(Role::Host) {
            return Err(PermissionError::NotHost(actor));
        }
        self.locks.retain(|l| !l.target.conflicts_with(target));
        Ok(self.promote_queue(now))
    }

    /// Record a lock granted elsewhere (replicated LockGrant message).
    /// Idempotent upsert keyed by holder and target.
    pub fn apply_grant(&mut self, holder: Uuid, target: LockTarget, now: Instant) {
        if let Some(l) = self
            .locks
            .iter_mut()
            .find(|l| l.holder == holder && l.target == target)
        {
            l.expires_at = now + self.config.lock_ttl;
            return;
        }
        self.locks.push(Lock {
            holder,
            target,
            expires_at: now + self.config.lock_ttl,
        });
    }

    /// Process a heartbeat: refresh liveness, mark active, and renew
    /// the sender's lock expiries (actively editing keeps locks alive).
    pub fn heartbeat(&mut self, id: Uuid, now: Instant) {
        if let Some(p) = self.participants.get_mut(&id) {
            p.last_heartbeat = Some(now);
            if p.connection != ConnectionState::Active {
                p.connection = ConnectionState::Active;
            }
        }
        self.renew_locks(id, now);
    }

    fn renew_locks(&mut self, id: Uuid, now: Instant) {
        let ttl = self.config.lock_ttl;
        for l in self.locks.iter_mut().filter(|l| l.holder == id) {
            l.expires_at = now + ttl;
        }
    }

    /// Expire stale locks and disconnect silent participants, then
    /// promote queued requests. Returns the promotions granted.
    pub fn expire(&mut self, now: Instant) -> Vec<(Uuid, LockTarget)> {
        let before = self.locks.len();
        self.locks.retain(|l| l.expires_at > now);
        if self.locks.len() < before {
            log::debug!("expired {} lock(s)", before - self.locks.len());
        }

        let timeout = self.config.heartbeat_timeout;
        let silent: Vec<Uuid> = self
            .participants
            .values()
            .filter(|p| {
                p.connection == ConnectionState::Active
                    && p.last_heartbeat.is_some_and(|hb| now.duration_since(hb) > timeout)
            })
            .map(|p| p.id)
            .collect();
        let mut granted = Vec::new();
        for id in silent {
            log::info!("participant {id} missed heartbeats, disconnecting");
            if let Some(p) = self.participants.get_mut(&id) {
                p.connection = ConnectionState::Disconnected;
            }
            granted.extend(self.release_all_for(id, now));
        }

        granted.extend(self.promote_queue(now));
        granted
    }

    fn release_all_for(&mut self, id: Uuid, now: Instant) -> Vec<(Uuid, LockTarget)> {
        let before = self.locks.len();
        self.locks.retain(|l| l.holder != id);
        if self.locks.len() < before {
            log::debug!("force-released {} lock(s) held by {id}", before - self.locks.len());
        }
        self.promote_queue(now)
    }

    fn promote_queue(&mut self, now: Instant) -> Vec<(Uuid, LockTarget)> {
        let mut granted = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some((id, target)) = self.queue.pop_front() {
            let eligible = self
                .participants
                .get(&id)
                .is_some_and(|p| p.connection != ConnectionState::Disconnected);
            let conflicts = self
                .locks
                .iter()
                .any(|l| l.holder != id && l.target.conflicts_with(&target));
            if eligible && !conflicts {
                self.locks.push(Lock {
                    holder: id,
                    target: target.clone(),
                    expires_at: now + self.config.lock_ttl,
                });
                granted.push((id, target));
            } else if eligible {
                remaining.push_back((id, target));
            }
        }
        self.queue = remaining;
        granted
    }
}
