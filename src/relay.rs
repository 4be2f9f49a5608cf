//! WebSocket relay: a dumb fan-out hub for rooms that span machines.
//!
//! Architecture:
//! ```text
//! Peer A ──┐
//!           ├── Room (room_id) ── per-peer outbound queues
//! Peer B ──┘         │
//!                    ├── Forward{All}   → every peer, sender included
//!                    └── Forward{Peers} → addressed peers only
//! ```
//!
//! The relay never inspects sync payloads; it registers peers via a
//! Hello frame, then forwards opaque bytes. Delivering `All` back to
//! the sender is deliberate: the echo of a notes step is its ack, and
//! it fixes the total order every peer observes.

use std::collections::HashMap;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::transport::{Delivery, Destination, Transport, TransportError};

/// Relay framing, bincode-encoded inside WebSocket binary messages.
/// Sync payloads travel opaque inside `Forward`/`Deliver`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// First frame on a connection: identify the peer and its room.
    Hello { peer_id: Uuid, room: Uuid },
    /// Peer → relay. `to: None` means everyone, sender included.
    Forward {
        to: Option<Vec<Uuid>>,
        payload: Vec<u8>,
    },
    /// Relay → peer.
    Deliver { from: Uuid, payload: Vec<u8> },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(frame)
    }
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Outbound queue depth per connected peer.
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
        }
    }
}

type RoomMap = Arc<RwLock<HashMap<Uuid, HashMap<Uuid, mpsc::Sender<Vec<u8>>>>>>;

/// The relay server. Holds no document state; rooms are just routing
/// tables from peer id to outbound queue.
pub struct RelayServer {
    config: RelayConfig,
    rooms: RoomMap,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Accept loop. Runs until the task is dropped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("relay connection from {addr}");
            let rooms = self.rooms.clone();
            let capacity = self.config.channel_capacity;
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, rooms, capacity).await {
                    log::warn!("relay connection from {addr} ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        rooms: RoomMap,
        capacity: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // First frame must be a Hello.
        let (peer_id, room) = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                    Ok(RelayFrame::Hello { peer_id, room }) => break (peer_id, room),
                    Ok(other) => {
                        log::warn!("frame before Hello: {other:?}, closing");
                        return Ok(());
                    }
                    Err(e) => {
                        log::warn!("undecodable frame before Hello: {e}");
                        return Ok(());
                    }
                },
                Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                _ => {}
            }
        };

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(capacity);
        rooms
            .write()
            .await
            .entry(room)
            .or_default()
            .insert(peer_id, out_tx);
        log::info!("peer {peer_id} joined relay room {room}");

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let frame = match RelayFrame::decode(&data) {
                                Ok(f) => f,
                                Err(e) => {
                                    log::warn!("dropping undecodable frame from {peer_id}: {e}");
                                    continue;
                                }
                            };
                            let RelayFrame::Forward { to, payload } = frame else {
                                log::debug!("ignoring non-Forward frame from {peer_id}");
                                continue;
                            };
                            let deliver = RelayFrame::Deliver { from: peer_id, payload };
                            let encoded = match deliver.encode() {
                                Ok(b) => b,
                                Err(e) => {
                                    log::warn!("encode failed: {e}");
                                    continue;
                                }
                            };

                            // Clone queue handles out of the lock, then await.
                            let targets: Vec<(Uuid, mpsc::Sender<Vec<u8>>)> = {
                                let rooms_r = rooms.read().await;
                                let Some(peers) = rooms_r.get(&room) else { continue };
                                match &to {
                                    None => peers.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
                                    Some(set) => peers
                                        .iter()
                                        .filter(|(id, _)| set.contains(id))
                                        .map(|(id, tx)| (*id, tx.clone()))
                                        .collect(),
                                }
                            };
                            for (target, tx) in targets {
                                if tx.send(encoded.clone()).await.is_err() {
                                    log::debug!("peer {target} queue closed");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Err(e)) => break Err(e.into()),
                        _ => {}
                    }
                }
                out = out_rx.recv() => {
                    match out {
                        Some(bytes) => ws_sender.send(Message::Binary(bytes.into())).await?,
                        None => break Ok(()),
                    }
                }
            }
        };

        // Cleanup: drop the peer, drop the room when it empties.
        let mut rooms_w = rooms.write().await;
        if let Some(peers) = rooms_w.get_mut(&room) {
            peers.remove(&peer_id);
            if peers.is_empty() {
                rooms_w.remove(&room);
                log::info!("relay room {room} removed (empty)");
            }
        }
        log::info!("peer {peer_id} left relay room {room}");
        result
    }
}

/// Client-side [`Transport`] over a WebSocket connection to a relay.
pub struct RelayTransport {
    peer_id: Uuid,
    out_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: Option<mpsc::Receiver<(Uuid, Vec<u8>)>>,
}

impl RelayTransport {
    /// Connect to a relay, join `room`, and spawn the reader/writer
    /// tasks. Inbound frames arrive on the receiver from
    /// [`take_inbound`].
    ///
    /// [`take_inbound`]: RelayTransport::take_inbound
    pub async fn connect(
        url: &str,
        peer_id: Uuid,
        room: Uuid,
    ) -> Result<Self, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let hello = RelayFrame::Hello { peer_id, room }.encode()?;
        ws_sender
            .send(Message::Binary(hello.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        // Writer task: outbound queue → socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: socket → inbound queue.
        let (inbound_tx, inbound_rx) = mpsc::channel::<(Uuid, Vec<u8>)>(256);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match RelayFrame::decode(&data) {
                        Ok(RelayFrame::Deliver { from, payload }) => {
                            if inbound_tx.send((from, payload)).await.is_err() {
                                break;
                            }
                        }
                        Ok(other) => log::debug!("unexpected relay frame: {other:?}"),
                        Err(e) => log::warn!("undecodable relay frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("relay connection closed");
        });

        Ok(Self {
            peer_id,
            out_tx,
            inbound_rx: Some(inbound_rx),
        })
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Take the inbound receiver (once).
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<(Uuid, Vec<u8>)>> {
        self.inbound_rx.take()
    }
}

impl Transport for RelayTransport {
    async fn send(
        &self,
        bytes: Vec<u8>,
        dest: Destination,
        delivery: Delivery,
    ) -> Result<(), TransportError> {
        let to = match dest {
            Destination::All => None,
            Destination::Peers(set) => Some(set.into_iter().collect()),
        };
        let frame = RelayFrame::Forward { to, payload: bytes }.encode()?;
        match delivery {
            Delivery::Reliable => self
                .out_tx
                .send(frame)
                .await
                .map_err(|_| TransportError::Closed),
            Delivery::BestEffort => {
                if let Err(e) = self.out_tx.try_send(frame) {
                    log::trace!("best-effort relay frame dropped: {e}");
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.channel_capacity, 256);
    }

    #[test]
    fn test_hello_frame_roundtrip() {
        let frame = RelayFrame::Hello {
            peer_id: Uuid::new_v4(),
            room: Uuid::new_v4(),
        };
        let decoded = RelayFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_forward_frame_roundtrip() {
        let all = RelayFrame::Forward {
            to: None,
            payload: vec![1, 2, 3],
        };
        assert_eq!(RelayFrame::decode(&all.encode().unwrap()).unwrap(), all);

        let addressed = RelayFrame::Forward {
            to: Some(vec![Uuid::new_v4()]),
            payload: vec![4, 5],
        };
        assert_eq!(
            RelayFrame::decode(&addressed.encode().unwrap()).unwrap(),
            addressed
        );
    }

    #[test]
    fn test_deliver_frame_roundtrip() {
        let frame = RelayFrame::Deliver {
            from: Uuid::new_v4(),
            payload: vec![9; 64],
        };
        assert_eq!(RelayFrame::decode(&frame.encode().unwrap()).unwrap(), frame);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(RelayFrame::decode(&[0xFF, 0xFE]).is_err());
    }
}
