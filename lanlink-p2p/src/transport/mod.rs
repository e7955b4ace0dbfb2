//! Transport layer: sockets, peer table, framing.
//!
//! Owns the TCP listener, the UDP socket, and the known-peers table.
//! Frames byte payloads over TCP, ships raw datagrams over UDP, and
//! announces presence with a subnet broadcast on startup. Everything
//! above this layer deals in envelopes; everything below is the OS
//! socket API.

pub mod connection;
pub mod framing;
pub mod peer;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use bytes::Bytes;
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};

pub use framing::FrameCodec;
pub use peer::{ConnState, PeerSnapshot};

/// Capacity of the lossless event pipeline to the layer above.
const PIPELINE_DEPTH: usize = 256;

/// Capacity of the lossy observer broadcast channel.
const BROADCAST_DEPTH: usize = 1024;

/// Events published by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer appeared, was reactivated, or went inactive.
    PeerChange {
        peer: PeerSnapshot,
        /// True when the peer just became active.
        active: bool,
    },
    /// One complete frame (TCP) or datagram (UDP) arrived.
    Message {
        /// Observed source IPv4 address.
        source_ip: String,
        /// Frame or datagram payload.
        payload: Bytes,
        /// True when the payload arrived over UDP.
        was_udp: bool,
    },
}

/// Shared state behind a [`Transport`] handle.
pub(crate) struct Inner {
    pub(crate) config: LinkConfig,
    pub(crate) peers: peer::PeerTable,
    /// Lossy tap for observers.
    broadcast_tx: broadcast::Sender<TransportEvent>,
    /// Lossless pipeline to the single consumer above (the object layer).
    pipeline: StdMutex<Option<mpsc::Sender<TransportEvent>>>,
    local_ip: OnceLock<Ipv4Addr>,
    conn_ids: AtomicU64,
    running: AtomicBool,
    runtime: Mutex<Option<RuntimeState>>,
}

/// Live resources owned while the layer runs.
struct RuntimeState {
    shutdown: watch::Sender<bool>,
    udp: Arc<UdpSocket>,
    tasks: Vec<JoinHandle<()>>,
}

impl Inner {
    pub(crate) fn next_conn_id(&self) -> u64 {
        self.conn_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish an event on both delivery paths. The pipeline send awaits,
    /// which is what carries TCP backpressure up through the stack.
    pub(crate) async fn emit(&self, event: TransportEvent) {
        let pipeline = self.pipeline.lock().unwrap().clone();
        if let Some(tx) = pipeline {
            let _ = tx.send(event.clone()).await;
        }
        let _ = self.broadcast_tx.send(event);
    }

    /// Record inbound traffic from `ip`, creating the peer if needed, and
    /// emit a peer-change when it (re)activates.
    pub(crate) async fn note_inbound(&self, ip: &str) {
        let activated = {
            let mut peers = self.peers.lock().await;
            let entry = peers
                .entry(ip.to_string())
                .or_insert_with(|| peer::Peer::new(ip.to_string()));
            if entry.mark_seen() {
                Some(entry.snapshot())
            } else {
                None
            }
        };
        if let Some(snapshot) = activated {
            tracing::debug!(addr = %ip, "Peer active");
            self.emit(TransportEvent::PeerChange {
                peer: snapshot,
                active: true,
            })
            .await;
        }
    }

    fn resolve_local_ip(&self) -> LinkResult<Ipv4Addr> {
        if let Some(ip) = self.local_ip.get() {
            return Ok(*ip);
        }
        let ip = detect_local_ip(self.config.bind_ip)?;
        // Another caller may have raced us; either value is the same.
        let _ = self.local_ip.set(ip);
        Ok(ip)
    }

    fn ensure_running(&self) -> LinkResult<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LinkError::NotRunning)
        }
    }

    /// Register a freshly established stream for `ip`, replacing (and
    /// closing) any prior connection from the same address.
    async fn register_connection(
        this: &Arc<Self>,
        ip: &str,
        stream: tokio::net::TcpStream,
        shutdown: watch::Receiver<bool>,
    ) -> mpsc::Sender<Bytes> {
        let handle = connection::spawn(this, ip.to_string(), stream, shutdown);
        let tx = handle.tx.clone();

        let (replaced, activated) = {
            let mut peers = this.peers.lock().await;
            let entry = peers
                .entry(ip.to_string())
                .or_insert_with(|| peer::Peer::new(ip.to_string()));
            let replaced = entry.conn.replace(handle);
            entry.state = ConnState::Established;
            let activated = entry.mark_seen().then(|| entry.snapshot());
            (replaced, activated)
        };

        if replaced.is_some() {
            tracing::debug!(addr = %ip, "Replaced prior connection");
        }
        drop(replaced);

        if let Some(snapshot) = activated {
            this.emit(TransportEvent::PeerChange {
                peer: snapshot,
                active: true,
            })
            .await;
        }

        tx
    }

    /// Get the writer queue for `ip`, opening a connection if none exists.
    async fn ensure_connection(this: &Arc<Self>, ip: &str) -> LinkResult<mpsc::Sender<Bytes>> {
        this.ensure_running()?;
        let ipv4: Ipv4Addr = ip.parse().map_err(|_| LinkError::InvalidAddress {
            addr: ip.to_string(),
        })?;

        // Fast path plus per-peer connect serialization.
        let connect_lock = {
            let mut peers = this.peers.lock().await;
            let entry = peers
                .entry(ip.to_string())
                .or_insert_with(|| peer::Peer::new(ip.to_string()));
            if let Some(conn) = &entry.conn {
                return Ok(conn.tx.clone());
            }
            entry.state = ConnState::Connecting;
            entry.connect_lock.clone()
        };
        let _guard = connect_lock.lock().await;

        // A concurrent send may have connected while we waited.
        {
            let peers = this.peers.lock().await;
            if let Some(conn) = peers.get(ip).and_then(|p| p.conn.as_ref()) {
                return Ok(conn.tx.clone());
            }
        }

        let shutdown = {
            let runtime = this.runtime.lock().await;
            runtime
                .as_ref()
                .ok_or(LinkError::NotRunning)?
                .shutdown
                .subscribe()
        };

        let target = SocketAddr::new(IpAddr::V4(ipv4), this.config.port);
        tracing::debug!(addr = %target, "Connecting to peer");

        let result = async {
            let socket = TcpSocket::new_v4()?;
            if let IpAddr::V4(bind) = this.config.bind_ip {
                if !bind.is_unspecified() {
                    socket.bind(SocketAddr::new(IpAddr::V4(bind), 0))?;
                }
            }
            match timeout(this.config.connect_timeout, socket.connect(target)).await {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(LinkError::Io(e)),
                Err(_) => Err(LinkError::ConnectTimeout {
                    addr: ip.to_string(),
                }),
            }
        }
        .await;

        match result {
            Ok(stream) => Ok(Inner::register_connection(this, ip, stream, shutdown).await),
            Err(e) => {
                let mut peers = this.peers.lock().await;
                if let Some(entry) = peers.get_mut(ip) {
                    if entry.conn.is_none() {
                        entry.state = ConnState::None;
                    }
                }
                Err(e)
            }
        }
    }

    async fn udp_socket(&self) -> LinkResult<Arc<UdpSocket>> {
        let runtime = self.runtime.lock().await;
        Ok(runtime.as_ref().ok_or(LinkError::NotRunning)?.udp.clone())
    }
}

/// Handle to the transport layer. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Create a stopped transport with the given configuration.
    pub fn new(config: LinkConfig) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_DEPTH);
        Self {
            inner: Arc::new(Inner {
                config,
                peers: Mutex::new(HashMap::new()),
                broadcast_tx,
                pipeline: StdMutex::new(None),
                local_ip: OnceLock::new(),
                conn_ids: AtomicU64::new(1),
                running: AtomicBool::new(false),
                runtime: Mutex::new(None),
            }),
        }
    }

    /// The configuration this transport was built with.
    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Subscribe to the lossy observer event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Take the lossless event pipeline. Intended for the single layer
    /// sitting directly on top; the pipeline applies backpressure to the
    /// socket readers, so its consumer must keep draining it.
    pub fn events_receiver(&self) -> mpsc::Receiver<TransportEvent> {
        let (tx, rx) = mpsc::channel(PIPELINE_DEPTH);
        *self.inner.pipeline.lock().unwrap() = Some(tx);
        rx
    }

    /// This node's IPv4 address. Memoized after the first call; a
    /// concrete `bind_ip` wins, otherwise the routing table decides.
    pub fn local_ip(&self) -> LinkResult<Ipv4Addr> {
        self.inner.resolve_local_ip()
    }

    /// Whether `start` has run and `stop` has not.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the known-peer table.
    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        let peers = self.inner.peers.lock().await;
        peers.values().map(|p| p.snapshot()).collect()
    }

    /// Bind sockets, spawn the accept and UDP receive loops, and announce
    /// presence with an empty broadcast datagram.
    ///
    /// Fails with [`LinkError::NoNetworkInterface`] when no local address
    /// can be determined, and with [`LinkError::Io`] when a bind fails;
    /// both are fatal for the layer.
    pub async fn start(&self) -> LinkResult<()> {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }

        let local = self.inner.resolve_local_ip()?;
        let bind_addr = SocketAddr::new(self.inner.config.bind_ip, self.inner.config.port);

        let listener = TcpListener::bind(bind_addr).await?;
        let udp = UdpSocket::bind(bind_addr).await?;
        udp.set_broadcast(true)?;
        let udp = Arc::new(udp);

        let (shutdown_tx, _) = watch::channel(false);

        let accept_task = tokio::spawn(accept_loop(
            self.inner.clone(),
            listener,
            shutdown_tx.subscribe(),
        ));
        let udp_task = tokio::spawn(udp_loop(
            self.inner.clone(),
            udp.clone(),
            shutdown_tx.subscribe(),
        ));

        self.inner.running.store(true, Ordering::SeqCst);
        *runtime = Some(RuntimeState {
            shutdown: shutdown_tx,
            udp,
            tasks: vec![accept_task, udp_task],
        });
        drop(runtime);

        tracing::info!(addr = %bind_addr, local_ip = %local, "Transport started");

        // Best-effort presence announcement.
        if let Err(e) = self.send_broadcast(Bytes::new()).await {
            tracing::debug!(error = %e, "Presence broadcast failed");
        }

        Ok(())
    }

    /// Stop background tasks, close every connection, and clear the peer
    /// table.
    pub async fn stop(&self) {
        let state = self.inner.runtime.lock().await.take();
        let Some(state) = state else {
            return;
        };

        self.inner.running.store(false, Ordering::SeqCst);
        let _ = state.shutdown.send(true);
        for task in state.tasks {
            task.abort();
        }

        // Dropping the handles aborts every connection task.
        self.inner.peers.lock().await.clear();

        tracing::info!("Transport stopped");
    }

    /// Frame `payload` and send it to `target_ip` over TCP, opening a
    /// connection if none exists.
    pub async fn send_tcp(&self, target_ip: &str, payload: Bytes) -> LinkResult<()> {
        let tx = Inner::ensure_connection(&self.inner, target_ip).await?;
        tx.send(payload).await.map_err(|_| {
            if self.is_running() {
                LinkError::ConnectionLost {
                    addr: target_ip.to_string(),
                }
            } else {
                LinkError::Cancelled
            }
        })
    }

    /// Send one datagram to `target_ip`. No delivery guarantee.
    pub async fn send_udp(&self, target_ip: &str, payload: Bytes) -> LinkResult<()> {
        let ipv4: Ipv4Addr = target_ip.parse().map_err(|_| LinkError::InvalidAddress {
            addr: target_ip.to_string(),
        })?;
        let udp = self.inner.udp_socket().await?;
        udp.send_to(&payload, SocketAddr::new(IpAddr::V4(ipv4), self.inner.config.port))
            .await?;
        Ok(())
    }

    /// Send one datagram to the subnet broadcast address.
    pub async fn send_broadcast(&self, payload: Bytes) -> LinkResult<()> {
        let udp = self.inner.udp_socket().await?;
        udp.send_to(
            &payload,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.inner.config.port),
        )
        .await?;
        Ok(())
    }

    /// Send `payload` over TCP to every known peer. Per-peer failures are
    /// logged, not propagated.
    pub async fn send_tcp_all(&self, payload: Bytes) {
        for addr in self.peer_addrs().await {
            if let Err(e) = self.send_tcp(&addr, payload.clone()).await {
                tracing::debug!(addr = %addr, error = %e, "Send to peer failed");
            }
        }
    }

    /// Send `payload` over UDP to every known peer.
    pub async fn send_udp_all(&self, payload: Bytes) {
        for addr in self.peer_addrs().await {
            if let Err(e) = self.send_udp(&addr, payload.clone()).await {
                tracing::debug!(addr = %addr, error = %e, "Datagram to peer failed");
            }
        }
    }

    /// Open a TCP connection to `target_ip` without sending anything.
    pub async fn direct_connect(&self, target_ip: &str) -> LinkResult<()> {
        Inner::ensure_connection(&self.inner, target_ip)
            .await
            .map(|_| ())
    }

    async fn peer_addrs(&self) -> Vec<String> {
        let peers = self.inner.peers.lock().await;
        peers.keys().cloned().collect()
    }
}

/// Accept inbound connections until shutdown.
async fn accept_loop(
    inner: Arc<Inner>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let IpAddr::V4(src) = addr.ip() else {
                        tracing::debug!(addr = %addr, "Dropping non-IPv4 connection");
                        continue;
                    };
                    let ip = src.to_string();
                    tracing::debug!(addr = %ip, "Accepted inbound connection");
                    Inner::register_connection(&inner, &ip, stream, shutdown.clone()).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept error");
                }
            }
        }
    }
    tracing::debug!("Accept loop stopped");
}

/// Receive datagrams until shutdown.
async fn udp_loop(inner: Arc<Inner>, socket: Arc<UdpSocket>, mut shutdown: watch::Receiver<bool>) {
    let local = inner.local_ip.get().copied();
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, src)) => {
                    let IpAddr::V4(src_ip) = src.ip() else { continue };
                    // Our own broadcasts loop back; drop them unless
                    // configured otherwise.
                    if !inner.config.forward_all && Some(src_ip) == local {
                        continue;
                    }
                    let ip = src_ip.to_string();
                    inner.note_inbound(&ip).await;
                    if len > 0 {
                        inner
                            .emit(TransportEvent::Message {
                                source_ip: ip,
                                payload: Bytes::copy_from_slice(&buf[..len]),
                                was_udp: true,
                            })
                            .await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "UDP receive error");
                }
            }
        }
    }
    tracing::debug!("UDP loop stopped");
}

/// Determine the local IPv4 address.
///
/// A concrete bind address is authoritative. Otherwise connect a
/// throwaway UDP socket toward a public address and read the source the
/// routing table picked; no packets are sent by `connect` on UDP.
fn detect_local_ip(bind_ip: IpAddr) -> LinkResult<Ipv4Addr> {
    if let IpAddr::V4(v4) = bind_ip {
        if !v4.is_unspecified() {
            return Ok(v4);
        }
    }

    let probe = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .map_err(|_| LinkError::NoNetworkInterface)?;
    probe
        .connect(("8.8.8.8", 53))
        .map_err(|_| LinkError::NoNetworkInterface)?;
    match probe.local_addr().map(|a| a.ip()) {
        Ok(IpAddr::V4(ip)) if !ip.is_unspecified() => Ok(ip),
        _ => Err(LinkError::NoNetworkInterface),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concrete_bind_ip_is_local_identity() {
        let ip = detect_local_ip("192.168.7.3".parse().unwrap()).unwrap();
        assert_eq!(ip, "192.168.7.3".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let transport = Transport::new(LinkConfig::new(0));
        let err = transport
            .send_tcp("127.0.0.1", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotRunning));

        let err = transport
            .send_udp("127.0.0.1", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotRunning));
    }

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let transport = Transport::new(
            LinkConfig::new(0).with_bind_ip("127.0.0.1".parse().unwrap()),
        );
        transport.start().await.unwrap();
        let err = transport
            .send_tcp("not-an-ip", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::InvalidAddress { .. }));
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let transport = Transport::new(
            LinkConfig::new(0).with_bind_ip("127.0.0.1".parse().unwrap()),
        );
        transport.stop().await;
        transport.start().await.unwrap();
        transport.stop().await;
        transport.stop().await;
        assert!(!transport.is_running());
    }
}
