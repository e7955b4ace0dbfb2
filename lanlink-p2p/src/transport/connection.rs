//! Per-connection reader and writer tasks.
//!
//! Every established TCP connection runs one reader task and one writer
//! task. The writer drains a bounded queue, which serializes concurrent
//! sends to the same peer (frame bytes never interleave) and propagates
//! TCP backpressure to producers. The reader turns frames into
//! `message-received` events and downgrades the peer on EOF, read errors,
//! or an idle timeout.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::transport::framing::FrameCodec;
use crate::transport::{Inner, TransportEvent};

/// Depth of the per-connection writer queue. Small, so queued file parts
/// stay within a few buffers' worth of memory.
const WRITE_QUEUE_DEPTH: usize = 8;

/// Spawn reader and writer tasks for an established stream and return the
/// handle that owns them. The caller registers the handle in the peer
/// table.
pub(crate) fn spawn(
    inner: &Arc<Inner>,
    ip: String,
    stream: TcpStream,
    shutdown: watch::Receiver<bool>,
) -> super::peer::ConnectionHandle {
    let conn_id = inner.next_conn_id();

    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(addr = %ip, error = %e, "Failed to set TCP_NODELAY");
    }

    let (read_half, write_half) = stream.into_split();
    let framed_read = FramedRead::new(read_half, FrameCodec::new(inner.config.max_frame_bytes));
    let framed_write = FramedWrite::new(write_half, FrameCodec::new(inner.config.max_frame_bytes));

    let (tx, rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);

    let writer = {
        let inner = inner.clone();
        let ip = ip.clone();
        tokio::spawn(async move {
            let reason = write_loop(framed_write, rx).await;
            drop_connection(&inner, &ip, conn_id, &reason).await;
        })
    };

    let reader = {
        let inner = inner.clone();
        let ip = ip.clone();
        tokio::spawn(async move {
            let reason = read_loop(&inner, &ip, framed_read, shutdown).await;
            drop_connection(&inner, &ip, conn_id, &reason).await;
        })
    };

    super::peer::ConnectionHandle {
        id: conn_id,
        tx,
        reader,
        writer,
    }
}

/// Drain the writer queue into the socket. Returns the reason the loop
/// ended.
async fn write_loop(
    mut framed: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::Receiver<Bytes>,
) -> String {
    while let Some(payload) = rx.recv().await {
        if let Err(e) = framed.send(payload).await {
            return format!("write failed: {e}");
        }
    }
    // All senders dropped: the connection was replaced or torn down.
    "writer queue closed".to_string()
}

/// Read frames until the connection dies. Returns the reason the loop
/// ended.
async fn read_loop(
    inner: &Arc<Inner>,
    ip: &str,
    mut framed: FramedRead<OwnedReadHalf, FrameCodec>,
    mut shutdown: watch::Receiver<bool>,
) -> String {
    let idle = inner.config.idle_timeout;
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return "shutdown".to_string();
                }
                continue;
            }
            result = async {
                match idle {
                    Some(t) => tokio::time::timeout(t, framed.next()).await,
                    None => Ok(framed.next().await),
                }
            } => result,
        };

        match frame {
            Err(_) => return "idle timeout".to_string(),
            Ok(None) => return "closed by peer".to_string(),
            Ok(Some(Err(e))) => return format!("read failed: {e}"),
            Ok(Some(Ok(payload))) => {
                tracing::trace!(addr = %ip, len = payload.len(), "Frame received");
                inner.note_inbound(ip).await;
                inner
                    .emit(TransportEvent::Message {
                        source_ip: ip.to_string(),
                        payload,
                        was_udp: false,
                    })
                    .await;
            }
        }
    }
}

/// Tear down a connection if it is still the one registered for `ip`.
///
/// Both tasks funnel through here; the connection id makes the teardown
/// idempotent and keeps a replaced connection's death from clobbering its
/// successor. The peer-change event is emitted before the handle is
/// dropped, because dropping it aborts the task running this function.
async fn drop_connection(inner: &Arc<Inner>, ip: &str, conn_id: u64, reason: &str) {
    let (handle, snapshot) = {
        let mut peers = inner.peers.lock().await;
        match peers.get_mut(ip) {
            Some(peer) if peer.conn.as_ref().map(|c| c.id) == Some(conn_id) => {
                let handle = peer.conn.take();
                peer.state = super::peer::ConnState::None;
                peer.active = false;
                (handle, Some(peer.snapshot()))
            }
            _ => (None, None),
        }
    };

    if let Some(peer) = snapshot {
        tracing::debug!(addr = %ip, reason, "Connection closed");
        inner
            .emit(TransportEvent::PeerChange {
                peer,
                active: false,
            })
            .await;
    }

    drop(handle);
}
