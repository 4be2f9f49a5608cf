//! Integration tests for end-to-end room sync over a relay.
//!
//! These tests start a real relay server and connect real peers,
//! verifying the full sync pipeline.

use roomsync::notes::StepKind;
use roomsync::permissions::LockTarget;
use roomsync::relay::{RelayConfig, RelayServer, RelayTransport};
use roomsync::room::{RoomConfig, RoomEngine, RoomEvent, RoomNotice};
use roomsync::storage::MemorySnapshotStore;
use roomsync::transport::{Delivery, Destination, Transport};
use roomsync::whiteboard::{RecordKind, SyncState};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return its ws:// URL.
async fn start_test_relay() -> String {
    let port = free_port().await;
    let config = RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        channel_capacity: 64,
    };
    let server = RelayServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the relay time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

struct NetPeer {
    engine: RoomEngine<RelayTransport, MemorySnapshotStore>,
    rx: mpsc::Receiver<(Uuid, Vec<u8>)>,
    notices: Vec<RoomNotice>,
}

async fn connect_peer(url: &str, room: Uuid) -> NetPeer {
    let id = Uuid::new_v4();
    let mut transport = RelayTransport::connect(url, id, room).await.unwrap();
    let rx = transport.take_inbound().unwrap();
    let engine = RoomEngine::open(
        id,
        room,
        transport,
        MemorySnapshotStore::new(),
        RoomConfig::default(),
    );
    NetPeer {
        engine,
        rx,
        notices: Vec::new(),
    }
}

/// Feed every peer the same roster in the same order.
async fn join_roster(peers: &mut [NetPeer]) {
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

/// Deliver relay frames to the engines until the wire goes quiet.
async fn settle(peers: &mut [NetPeer]) {
    loop {
        let mut delivered = false;
        for peer in peers.iter_mut() {
            while let Ok(Some((from, bytes))) =
                timeout(Duration::from_millis(200), peer.rx.recv()).await
            {
                let notices = peer.engine.process(RoomEvent::Frame { from, bytes }).await;
                peer.notices.extend(notices);
                delivered = true;
            }
        }
        if !delivered {
            break;
        }
    }
}

#[tokio::test]
async fn test_relay_accepts_connections() {
    let url = start_test_relay().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to relay");
}

#[tokio::test]
async fn test_whiteboard_converges_over_relay() {
    let url = start_test_relay().await;
    let room = Uuid::new_v4();
    let a = connect_peer(&url, room).await;
    let b = connect_peer(&url, room).await;
    let mut peers = [a, b];
    join_roster(&mut peers).await;

    let record = Uuid::new_v4();
    peers[0]
        .engine
        .process(RoomEvent::WhiteboardEdit {
            id: record,
            kind: RecordKind::Shape,
            attrs: b"ellipse".to_vec(),
        })
        .await;
    settle(&mut peers).await;

    assert_eq!(
        peers[0].engine.whiteboard().doc().records,
        peers[1].engine.whiteboard().doc().records
    );
    assert_eq!(
        peers[1].engine.whiteboard().doc().get(&record).unwrap().attrs,
        b"ellipse"
    );
}

#[tokio::test]
async fn test_concurrent_record_edits_pick_one_winner() {
    let url = start_test_relay().await;
    let room = Uuid::new_v4();
    let a = connect_peer(&url, room).await;
    let b = connect_peer(&url, room).await;
    let mut peers = [a, b];
    join_roster(&mut peers).await;

    // Both peers restyle the same record before hearing each other.
    let record = Uuid::new_v4();
    peers[0]
        .engine
        .process(RoomEvent::WhiteboardEdit {
            id: record,
            kind: RecordKind::Shape,
            attrs: b"red".to_vec(),
        })
        .await;
    peers[1]
        .engine
        .process(RoomEvent::WhiteboardEdit {
            id: record,
            kind: RecordKind::Shape,
            attrs: b"blue".to_vec(),
        })
        .await;
    settle(&mut peers).await;

    let a_rec = peers[0].engine.whiteboard().doc().get(&record).unwrap();
    let b_rec = peers[1].engine.whiteboard().doc().get(&record).unwrap();
    assert_eq!(a_rec, b_rec, "Both peers must agree on the winner");
    assert!(a_rec.attrs == b"red" || a_rec.attrs == b"blue");
}

#[tokio::test]
async fn test_notes_converge_over_relay() {
    let url = start_test_relay().await;
    let room = Uuid::new_v4();
    let a = connect_peer(&url, room).await;
    let b = connect_peer(&url, room).await;
    let mut peers = [a, b];
    join_roster(&mut peers).await;

    peers[0]
        .engine
        .process(RoomEvent::NotesEdit(StepKind::Insert {
            pos: 0,
            text: "agenda".into(),
        }))
        .await;
    settle(&mut peers).await;

    // Concurrent edits from both sides.
    peers[0]
        .engine
        .process(RoomEvent::NotesEdit(StepKind::Insert {
            pos: 6,
            text: " items".into(),
        }))
        .await;
    peers[1]
        .engine
        .process(RoomEvent::NotesEdit(StepKind::Delete { from: 0, to: 2 }))
        .await;
    settle(&mut peers).await;

    assert_eq!(
        peers[0].engine.notes().confirmed().text,
        peers[1].engine.notes().confirmed().text
    );
    assert_eq!(peers[0].engine.notes().pending_len(), 0);
    assert_eq!(peers[1].engine.notes().pending_len(), 0);
}

#[tokio::test]
async fn test_late_joiner_snapshots_both_documents() {
    let url = start_test_relay().await;
    let room = Uuid::new_v4();
    let a = connect_peer(&url, room).await;
    let mut solo = [a];
    join_roster(&mut solo).await;

    solo[0]
        .engine
        .process(RoomEvent::WhiteboardEdit {
            id: Uuid::new_v4(),
            kind: RecordKind::Page,
            attrs: b"page 1".to_vec(),
        })
        .await;
    solo[0]
        .engine
        .process(RoomEvent::NotesEdit(StepKind::Insert {
            pos: 0,
            text: "minutes".into(),
        }))
        .await;
    settle(&mut solo).await;
    let [a] = solo;

    // New peer joins mid-session and syncs from a's snapshots.
    let c_id = Uuid::new_v4();
    let mut transport = RelayTransport::connect(&url, c_id, room).await.unwrap();
    let rx = transport.take_inbound().unwrap();
    let engine = RoomEngine::join(
        c_id,
        room,
        transport,
        MemorySnapshotStore::new(),
        RoomConfig::default(),
    )
    .await;
    let c = NetPeer {
        engine,
        rx,
        notices: Vec::new(),
    };
    assert!(matches!(c.engine.whiteboard().state(), SyncState::Syncing { .. }));
    assert!(matches!(c.engine.notes().state(), SyncState::Syncing { .. }));

    let mut peers = [a, c];
    settle(&mut peers).await;

    assert_eq!(peers[1].engine.whiteboard().state(), SyncState::Live);
    assert_eq!(peers[1].engine.notes().state(), SyncState::Live);
    assert_eq!(
        peers[0].engine.whiteboard().doc().records,
        peers[1].engine.whiteboard().doc().records
    );
    assert_eq!(peers[1].engine.notes().confirmed().text, "minutes");
}

#[tokio::test]
async fn test_lock_claim_replicates_and_blocks_rival_edit() {
    let url = start_test_relay().await;
    let room = Uuid::new_v4();
    let a = connect_peer(&url, room).await;
    let b = connect_peer(&url, room).await;
    let a_id = a.engine.local_id();
    let mut peers = [a, b];
    join_roster(&mut peers).await;

    peers[0]
        .engine
        .process(RoomEvent::Lock {
            target: LockTarget::Notes,
            release: false,
        })
        .await;
    settle(&mut peers).await;

    // Both permission tables record the same holder.
    for peer in &peers {
        assert!(peer.engine.permissions().holds_lock(&a_id, &LockTarget::Notes));
    }

    // The rival's edit is rejected locally.
    let notices = peers[1]
        .engine
        .process(RoomEvent::NotesEdit(StepKind::Insert {
            pos: 0,
            text: "x".into(),
        }))
        .await;
    assert_eq!(notices, vec![RoomNotice::LockDenied]);

    // Releasing unblocks it.
    peers[0]
        .engine
        .process(RoomEvent::Lock {
            target: LockTarget::Notes,
            release: true,
        })
        .await;
    settle(&mut peers).await;
    let notices = peers[1]
        .engine
        .process(RoomEvent::NotesEdit(StepKind::Insert {
            pos: 0,
            text: "x".into(),
        }))
        .await;
    assert!(notices.is_empty());
}

#[tokio::test]
async fn test_addressed_frames_skip_other_peers() {
    let url = start_test_relay().await;
    let room = Uuid::new_v4();
    let a_id = Uuid::new_v4();
    let b_id = Uuid::new_v4();
    let c_id = Uuid::new_v4();

    let a = RelayTransport::connect(&url, a_id, room).await.unwrap();
    let mut b = RelayTransport::connect(&url, b_id, room).await.unwrap();
    let mut c = RelayTransport::connect(&url, c_id, room).await.unwrap();
    let mut b_rx = b.take_inbound().unwrap();
    let mut c_rx = c.take_inbound().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let dest = Destination::Peers([b_id].into_iter().collect());
    a.send(vec![7, 7, 7], dest, Delivery::Reliable).await.unwrap();

    let (from, payload) = timeout(Duration::from_secs(2), b_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, a_id);
    assert_eq!(payload, vec![7, 7, 7]);

    let unaddressed = timeout(Duration::from_millis(200), c_rx.recv()).await;
    assert!(unaddressed.is_err(), "c should not receive addressed frame");
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let url = start_test_relay().await;
    let room1 = Uuid::new_v4();
    let room2 = Uuid::new_v4();

    let a = RelayTransport::connect(&url, Uuid::new_v4(), room1).await.unwrap();
    let mut b = RelayTransport::connect(&url, Uuid::new_v4(), room2).await.unwrap();
    let mut b_rx = b.take_inbound().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    a.send(vec![1, 2, 3], Destination::All, Delivery::Reliable)
        .await
        .unwrap();

    let crossed = timeout(Duration::from_millis(200), b_rx.recv()).await;
    assert!(crossed.is_err(), "Frames must not cross rooms");
}

#[tokio::test]
async fn test_sender_receives_own_echo() {
    let url = start_test_relay().await;
    let room = Uuid::new_v4();
    let a_id = Uuid::new_v4();
    let mut a = RelayTransport::connect(&url, a_id, room).await.unwrap();
    let mut a_rx = a.take_inbound().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    a.send(vec![9], Destination::All, Delivery::Reliable)
        .await
        .unwrap();

    let (from, payload) = timeout(Duration::from_secs(2), a_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, a_id);
    assert_eq!(payload, vec![9]);
}
