//! Binary protocol for room synchronization.
//!
//! Wire format (one version byte, then a bincode-encoded envelope):
//! ```text
//! ┌──────────┬───────────┬──────────┬───────────────────────┐
//! │ version  │ sender    │ seq      │ body (tagged enum)    │
//! │ 1 byte   │ 16 bytes  │ 8 bytes  │ variable              │
//! └──────────┴───────────┴──────────┴───────────────────────┘
//! ```
//!
//! The body enum is closed: an unknown tag or a different version byte
//! decodes to an error, and the caller logs and drops the frame rather
//! than failing the session.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notes::{NotesDocument, Step};
use crate::permissions::{LockTarget, Role};
use crate::whiteboard::{WhiteboardDocument, WhiteboardPatch};

/// Current wire protocol version. Bumped on any incompatible change.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message kind discriminant, used for routing and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    WhiteboardPatch = 1,
    WhiteboardSnapshotRequest = 2,
    WhiteboardSnapshotReply = 3,
    NotesStep = 4,
    NotesSnapshotRequest = 5,
    NotesSnapshotReply = 6,
    RoleChange = 7,
    LockRequest = 8,
    LockGrant = 9,
    Heartbeat = 10,
}

/// Typed message body. Every frame in the room is one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncBody {
    /// Changed whiteboard records (LWW merge on receipt).
    WhiteboardPatch(WhiteboardPatch),
    /// Ask any live peer for the full whiteboard state.
    WhiteboardSnapshotRequest { request_id: Uuid },
    /// Full whiteboard state answering a request.
    WhiteboardSnapshotReply {
        request_id: Uuid,
        snapshot: WhiteboardDocument,
    },
    /// A notes edit step (the author's echo doubles as its ack).
    NotesStep(Step),
    /// Ask any live peer for the confirmed notes document.
    NotesSnapshotRequest { request_id: Uuid },
    /// Confirmed notes document answering a request.
    NotesSnapshotReply {
        request_id: Uuid,
        snapshot: NotesDocument,
    },
    /// Host changed a participant's role.
    RoleChange { participant: Uuid, role: Role },
    /// Claim (or with `release` set, give up) an exclusive lock.
    LockRequest { target: LockTarget, release: bool },
    /// Replicated grant so every peer tracks the same lock table.
    LockGrant {
        holder: Uuid,
        target: LockTarget,
        ttl_ms: u64,
    },
    /// Presence keepalive; renews the sender's lock expiries.
    Heartbeat,
}

impl SyncBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            SyncBody::WhiteboardPatch(_) => MessageKind::WhiteboardPatch,
            SyncBody::WhiteboardSnapshotRequest { .. } => MessageKind::WhiteboardSnapshotRequest,
            SyncBody::WhiteboardSnapshotReply { .. } => MessageKind::WhiteboardSnapshotReply,
            SyncBody::NotesStep(_) => MessageKind::NotesStep,
            SyncBody::NotesSnapshotRequest { .. } => MessageKind::NotesSnapshotRequest,
            SyncBody::NotesSnapshotReply { .. } => MessageKind::NotesSnapshotReply,
            SyncBody::RoleChange { .. } => MessageKind::RoleChange,
            SyncBody::LockRequest { .. } => MessageKind::LockRequest,
            SyncBody::LockGrant { .. } => MessageKind::LockGrant,
            SyncBody::Heartbeat => MessageKind::Heartbeat,
        }
    }
}

/// Top-level envelope: sender identity, per-sender sequence number, body.
///
/// `seq` increases by one per frame the sender broadcasts and drives
/// stale-frame drops and reorder buffering on the receive path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub sender: Uuid,
    pub seq: u64,
    pub body: SyncBody,
}

impl SyncMessage {
    pub fn new(sender: Uuid, seq: u64, body: SyncBody) -> Self {
        Self { sender, seq, body }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Serialize to the versioned wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Deserialize from the versioned wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&version, body) = bytes
            .split_first()
            .ok_or_else(|| ProtocolError::Malformed("empty frame".into()))?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let (msg, _) = bincode::serde::decode_from_slice(body, bincode::config::standard())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors. All of them are per-frame: the frame is logged and
/// dropped, the session continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame failed to decode.
    Malformed(String),
    /// Frame carried a protocol version we do not speak.
    UnsupportedVersion(u8),
    /// Encoding failed (should not happen for well-formed bodies).
    Encode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed frame: {e}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version {v}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::StepKind;
    use crate::whiteboard::{RecordKind, WhiteboardRecord};
    use std::collections::BTreeSet;

    fn patch_body() -> SyncBody {
        let id = Uuid::new_v4();
        SyncBody::WhiteboardPatch(WhiteboardPatch {
            base_seq: 9,
            records: vec![WhiteboardRecord {
                id,
                kind: RecordKind::Shape,
                attrs: vec![1, 2, 3],
                revision: 4,
                last_writer: Uuid::new_v4(),
            }],
        })
    }

    #[test]
    fn test_whiteboard_patch_roundtrip() {
        let sender = Uuid::new_v4();
        let msg = SyncMessage::new(sender, 42, patch_body());

        let encoded = msg.encode().unwrap();
        assert_eq!(encoded[0], PROTOCOL_VERSION);

        let decoded = SyncMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.sender, sender);
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.kind(), MessageKind::WhiteboardPatch);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_notes_step_roundtrip() {
        let step = Step {
            id: Uuid::new_v4(),
            author: Uuid::new_v4(),
            base_version: 17,
            kind: StepKind::Insert {
                pos: 3,
                text: "hi".into(),
            },
        };
        let msg = SyncMessage::new(step.author, 1, SyncBody::NotesStep(step.clone()));
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded.body {
            SyncBody::NotesStep(s) => assert_eq!(s, step),
            other => panic!("expected NotesStep, got {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_request_reply_roundtrip() {
        let request_id = Uuid::new_v4();
        let req = SyncMessage::new(
            Uuid::new_v4(),
            0,
            SyncBody::NotesSnapshotRequest { request_id },
        );
        let decoded = SyncMessage::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind(), MessageKind::NotesSnapshotRequest);

        let reply = SyncMessage::new(
            Uuid::new_v4(),
            5,
            SyncBody::NotesSnapshotReply {
                request_id,
                snapshot: NotesDocument {
                    text: "shared".into(),
                    marks: Vec::new(),
                    version: 12,
                },
            },
        );
        let decoded = SyncMessage::decode(&reply.encode().unwrap()).unwrap();
        match decoded.body {
            SyncBody::NotesSnapshotReply { request_id: got, snapshot } => {
                assert_eq!(got, request_id);
                assert_eq!(snapshot.version, 12);
            }
            other => panic!("expected NotesSnapshotReply, got {other:?}"),
        }
    }

    #[test]
    fn test_lock_messages_roundtrip() {
        let records: BTreeSet<Uuid> = [Uuid::new_v4(), Uuid::new_v4()].into_iter().collect();
        let msg = SyncMessage::new(
            Uuid::new_v4(),
            3,
            SyncBody::LockRequest {
                target: LockTarget::WhiteboardRecords(records.clone()),
                release: false,
            },
        );
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded.body {
            SyncBody::LockRequest { target: LockTarget::WhiteboardRecords(got), release } => {
                assert_eq!(got, records);
                assert!(!release);
            }
            other => panic!("expected LockRequest, got {other:?}"),
        }

        let grant = SyncMessage::new(
            Uuid::new_v4(),
            4,
            SyncBody::LockGrant {
                holder: Uuid::new_v4(),
                target: LockTarget::Notes,
                ttl_ms: 30_000,
            },
        );
        let decoded = SyncMessage::decode(&grant.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind(), MessageKind::LockGrant);
    }

    #[test]
    fn test_role_change_and_heartbeat_roundtrip() {
        let target = Uuid::new_v4();
        let msg = SyncMessage::new(
            Uuid::new_v4(),
            8,
            SyncBody::RoleChange {
                participant: target,
                role: Role::Host,
            },
        );
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind(), MessageKind::RoleChange);

        let hb = SyncMessage::new(Uuid::new_v4(), 9, SyncBody::Heartbeat);
        let decoded = SyncMessage::decode(&hb.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind(), MessageKind::Heartbeat);
    }

    #[test]
    fn test_decode_empty_frame() {
        assert!(matches!(
            SyncMessage::decode(&[]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_wrong_version() {
        let msg = SyncMessage::new(Uuid::new_v4(), 0, SyncBody::Heartbeat);
        let mut bytes = msg.encode().unwrap();
        bytes[0] = PROTOCOL_VERSION + 1;
        assert_eq!(
            SyncMessage::decode(&bytes),
            Err(ProtocolError::UnsupportedVersion(PROTOCOL_VERSION + 1))
        );
    }

    #[test]
    fn test_decode_garbage() {
        let garbage = [PROTOCOL_VERSION, 0xFF, 0xFE, 0xFD];
        assert!(matches!(
            SyncMessage::decode(&garbage),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_heartbeat_is_small() {
        let msg = SyncMessage::new(Uuid::new_v4(), u64::MAX, SyncBody::Heartbeat);
        let encoded = msg.encode().unwrap();
        // 1 version + 16 sender + varint seq + 1 tag, nothing else.
        assert!(encoded.len() < 32, "heartbeat frame {} bytes", encoded.len());
    }
}
