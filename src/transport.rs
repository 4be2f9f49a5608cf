//! Transport adapter — the seam between the sync engines and the wire.
//!
//! Engines never talk to sockets directly. They hand encoded frames to a
//! [`Transport`] with a destination and a delivery class, and consume an
//! inbound channel of `(sender, bytes)` pairs. Two implementations ship:
//! [`LocalHub`] wires peers together in-process (tests and benchmarks),
//! and `RelayTransport` in the relay module speaks WebSockets.
//!
//! Delivery classes:
//! - `Reliable` — document state (patches, steps, snapshots, locks).
//!   Sends apply backpressure and are retried with exponential backoff.
//! - `BestEffort` — presence (heartbeats). Dropped on a full channel,
//!   never retried.
//!
//! A broadcast to `All` is delivered to every peer including the sender;
//! the echo is what confirms a notes step, so filtering out self frames
//! is the receiver's decision, not the transport's.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Default inbound channel depth per peer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Delivery class for an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Must arrive; sends await capacity and callers may retry.
    Reliable,
    /// May be dropped under pressure; never retried.
    BestEffort,
}

/// Where a frame goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Every peer in the room, the sender included.
    All,
    /// A specific set of peers (snapshot replies go to the requester).
    Peers(HashSet<Uuid>),
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The send failed; reliable sends may be retried.
    SendFailed(String),
    /// The transport is shut down, no retry will help.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendFailed(e) => write!(f, "send failed: {e}"),
            Self::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Session-layer message plumbing.
///
/// Implementations guarantee per-sender FIFO for reliable frames; they
/// do not guarantee cross-sender ordering, delivery of best-effort
/// frames, or deduplication. The protocol layer handles the rest.
pub trait Transport {
    fn send(
        &self,
        bytes: Vec<u8>,
        dest: Destination,
        delivery: Delivery,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
}

type PeerMap = Arc<Mutex<HashMap<Uuid, mpsc::Sender<(Uuid, Vec<u8>)>>>>;

/// In-process transport hub. Every registered peer gets an endpoint
/// (its sending half) and an inbound receiver of `(sender, bytes)`.
pub struct LocalHub {
    peers: PeerMap,
    capacity: usize,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// Register a peer, returning its endpoint and inbound receiver.
    pub fn register(&self, peer_id: Uuid) -> (LocalEndpoint, mpsc::Receiver<(Uuid, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.peers
            .lock()
            .expect("peer map lock poisoned")
            .insert(peer_id, tx);
        let endpoint = LocalEndpoint {
            local_id: peer_id,
            peers: self.peers.clone(),
        };
        (endpoint, rx)
    }

    /// Drop a peer; in-flight frames to it are discarded.
    pub fn unregister(&self, peer_id: &Uuid) {
        self.peers
            .lock()
            .expect("peer map lock poisoned")
            .remove(peer_id);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peer map lock poisoned").len()
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer's sending half of a [`LocalHub`].
#[derive(Clone)]
pub struct LocalEndpoint {
    local_id: Uuid,
    peers: PeerMap,
}

impl LocalEndpoint {
    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    fn targets(&self, dest: &Destination) -> Vec<(Uuid, mpsc::Sender<(Uuid, Vec<u8>)>)> {
        let peers = self.peers.lock().expect("peer map lock poisoned");
        match dest {
            Destination::All => peers.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
            Destination::Peers(set) => peers
                .iter()
                .filter(|(id, _)| set.contains(id))
                .map(|(id, tx)| (*id, tx.clone()))
                .collect(),
        }
    }
}

impl Transport for LocalEndpoint {
    async fn send(
        &self,
        bytes: Vec<u8>,
        dest: Destination,
        delivery: Delivery,
    ) -> Result<(), TransportError> {
        // Senders are cloned out of the lock before any await.
        let targets = self.targets(&dest);
        for (peer, tx) in targets {
            match delivery {
                Delivery::Reliable => {
                    tx.send((self.local_id, bytes.clone()))
                        .await
                        .map_err(|_| TransportError::SendFailed(format!("peer {peer} gone")))?;
                }
                Delivery::BestEffort => {
                    if let Err(e) = tx.try_send((self.local_id, bytes.clone())) {
                        log::trace!("best-effort frame to {peer} dropped: {e}");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Bounded exponential backoff for reliable sends.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base * 2^attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Send a reliable frame, retrying transient failures per `policy`.
/// `Closed` is terminal and returned immediately.
pub async fn send_with_retry<T: Transport>(
    transport: &T,
    bytes: Vec<u8>,
    dest: Destination,
    policy: RetryPolicy,
) -> Result<(), TransportError> {
    let mut attempt = 0;
    loop {
        match transport
            .send(bytes.clone(), dest.clone(), Delivery::Reliable)
            .await
        {
            Ok(()) => return Ok(()),
            Err(TransportError::Closed) => return Err(TransportError::Closed),
            Err(e) if attempt + 1 >= policy.max_attempts => {
                log::warn!("send failed after {} attempts: {e}", attempt + 1);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay(attempt);
                log::debug!("send attempt {} failed ({e}), retrying in {delay:?}", attempt + 1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
