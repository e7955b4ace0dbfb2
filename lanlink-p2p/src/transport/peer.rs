//! Peer table and per-peer connection state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// State of a peer's TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    /// No connection.
    #[default]
    None,
    /// An outbound connection attempt is in flight.
    Connecting,
    /// A connection is established and framed I/O is running.
    Established,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::None => write!(f, "none"),
            ConnState::Connecting => write!(f, "connecting"),
            ConnState::Established => write!(f, "established"),
        }
    }
}

/// Handle to a live connection's tasks and writer queue.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    /// Identifies this connection across replacements.
    pub id: u64,
    /// Bounded writer queue; sending here serializes frame writes.
    pub tx: mpsc::Sender<Bytes>,
    /// Reader task, aborted when the connection is replaced or dropped.
    pub reader: JoinHandle<()>,
    /// Writer task.
    pub writer: JoinHandle<()>,
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// One known peer, keyed by its IPv4 address string.
#[derive(Debug)]
pub(crate) struct Peer {
    /// IPv4 address string; also the table key.
    pub addr: String,
    /// Last time any traffic arrived from this peer.
    pub last_seen: Instant,
    /// Whether the peer is currently considered reachable.
    pub active: bool,
    /// TCP connection, if any.
    pub conn: Option<ConnectionHandle>,
    /// Connection state for observers.
    pub state: ConnState,
    /// Serializes outbound connection attempts to this peer.
    pub connect_lock: Arc<Mutex<()>>,
}

impl Peer {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            last_seen: Instant::now(),
            active: false,
            conn: None,
            state: ConnState::None,
            connect_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Record inbound traffic. Returns true when this flipped the peer
    /// from inactive to active.
    pub fn mark_seen(&mut self) -> bool {
        self.last_seen = Instant::now();
        let became_active = !self.active;
        self.active = true;
        became_active
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            addr: self.addr.clone(),
            active: self.active,
            state: self.state,
            last_seen: self.last_seen,
        }
    }
}

/// Immutable view of a peer, carried in events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    /// IPv4 address string.
    pub addr: String,
    /// Whether the peer is currently active.
    pub active: bool,
    /// Connection state at the time of the event.
    pub state: ConnState,
    /// When traffic last arrived from this peer.
    pub last_seen: Instant,
}

impl fmt::Display for PeerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {})",
            self.addr,
            if self.active { "active" } else { "inactive" },
            self.state
        )
    }
}

/// The known-peers table. All access goes through one lock; snapshots for
/// broadcast iteration are taken under it and released before I/O.
pub(crate) type PeerTable = Mutex<HashMap<String, Peer>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_seen_transitions() {
        let mut peer = Peer::new("10.0.0.1".to_string());
        assert!(!peer.active);
        assert!(peer.mark_seen());
        assert!(peer.active);
        // Already active: no transition.
        assert!(!peer.mark_seen());

        peer.active = false;
        assert!(peer.mark_seen());
    }

    #[test]
    fn test_snapshot_display() {
        let mut peer = Peer::new("10.0.0.1".to_string());
        peer.mark_seen();
        peer.state = ConnState::Established;
        let snap = peer.snapshot();
        assert_eq!(format!("{}", snap), "10.0.0.1 (active, established)");
    }
}
