//! Object layer: envelopes, type registry, dispatch.
//!
//! Wraps typed messages in self-describing envelopes on the way out and
//! decodes incoming envelopes through the type registry on the way in.
//! Dispatch runs in a single task fed by the transport's lossless
//! pipeline, so messages from one sender are delivered in arrival order.

pub mod registry;

use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use lanlink_core::{Envelope, WireMessage};

use crate::error::LinkResult;
use crate::transport::{PeerSnapshot, Transport, TransportEvent};

pub use registry::{DynObject, TypeRegistry};

const PIPELINE_DEPTH: usize = 256;
const BROADCAST_DEPTH: usize = 1024;

/// Metadata accompanying a decoded object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Sender address from the envelope.
    pub source_ip: String,
    /// Wire-visible type tag.
    pub type_tag: String,
    /// True when the envelope arrived in a datagram.
    pub was_udp: bool,
}

/// Events published by the object layer.
#[derive(Clone)]
pub enum ObjectEvent {
    /// Transport peer-change, re-exposed.
    PeerChange { peer: PeerSnapshot, active: bool },
    /// A registered object arrived and decoded successfully.
    Object { meta: ObjectMeta, object: DynObject },
}

impl std::fmt::Debug for ObjectEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectEvent::PeerChange { peer, active } => f
                .debug_struct("PeerChange")
                .field("peer", peer)
                .field("active", active)
                .finish(),
            ObjectEvent::Object { meta, .. } => {
                f.debug_struct("Object").field("meta", meta).finish()
            }
        }
    }
}

struct MessengerInner {
    transport: Transport,
    registry: TypeRegistry,
    broadcast_tx: broadcast::Sender<ObjectEvent>,
    pipeline: StdMutex<Option<mpsc::Sender<ObjectEvent>>>,
    runtime: Mutex<Option<RuntimeState>>,
}

struct RuntimeState {
    shutdown: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
}

impl MessengerInner {
    async fn emit(&self, event: ObjectEvent) {
        let pipeline = self.pipeline.lock().unwrap().clone();
        if let Some(tx) = pipeline {
            let _ = tx.send(event.clone()).await;
        }
        let _ = self.broadcast_tx.send(event);
    }
}

/// Handle to the object layer. Cheap to clone.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<MessengerInner>,
}

impl Messenger {
    /// Create a messenger on top of a transport.
    pub fn new(transport: Transport) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_DEPTH);
        Self {
            inner: Arc::new(MessengerInner {
                transport,
                registry: TypeRegistry::new(),
                broadcast_tx,
                pipeline: StdMutex::new(None),
                runtime: Mutex::new(None),
            }),
        }
    }

    /// Register a message type for receive-side dispatch.
    pub fn register<T: WireMessage>(&self) {
        self.inner.registry.register::<T>();
    }

    /// The transport beneath this messenger.
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Subscribe to the lossy observer event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ObjectEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Take the lossless event pipeline for the layer above.
    pub fn events_receiver(&self) -> mpsc::Receiver<ObjectEvent> {
        let (tx, rx) = mpsc::channel(PIPELINE_DEPTH);
        *self.inner.pipeline.lock().unwrap() = Some(tx);
        rx
    }

    /// Start the transport and the dispatch task.
    pub async fn start(&self) -> LinkResult<()> {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }

        // Claim the transport pipeline before the sockets go live so no
        // early message is missed.
        let events = self.inner.transport.events_receiver();
        self.inner.transport.start().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatch = tokio::spawn(dispatch_loop(self.inner.clone(), events, shutdown_rx));

        *runtime = Some(RuntimeState {
            shutdown: shutdown_tx,
            dispatch,
        });
        Ok(())
    }

    /// Stop the dispatch task, then the transport.
    pub async fn stop(&self) {
        let state = self.inner.runtime.lock().await.take();
        if let Some(state) = state {
            let _ = state.shutdown.send(true);
            state.dispatch.abort();
        }
        self.inner.transport.stop().await;
    }

    fn envelope<T: WireMessage>(&self, msg: &T) -> LinkResult<Bytes> {
        let source = self.inner.transport.local_ip()?.to_string();
        Ok(Envelope::wrap(source, msg)?.encode()?)
    }

    /// Serialize `msg`, wrap it in an envelope, and send it over TCP.
    pub async fn send_tcp<T: WireMessage>(&self, target_ip: &str, msg: &T) -> LinkResult<()> {
        let bytes = self.envelope(msg)?;
        self.inner.transport.send_tcp(target_ip, bytes).await
    }

    /// Serialize `msg` and send it in a single datagram.
    pub async fn send_udp<T: WireMessage>(&self, target_ip: &str, msg: &T) -> LinkResult<()> {
        let bytes = self.envelope(msg)?;
        self.inner.transport.send_udp(target_ip, bytes).await
    }

    /// Serialize `msg` and broadcast it to the subnet.
    pub async fn send_broadcast<T: WireMessage>(&self, msg: &T) -> LinkResult<()> {
        let bytes = self.envelope(msg)?;
        self.inner.transport.send_broadcast(bytes).await
    }

    /// Send `msg` over TCP to every known peer.
    pub async fn send_tcp_all<T: WireMessage>(&self, msg: &T) -> LinkResult<()> {
        let bytes = self.envelope(msg)?;
        self.inner.transport.send_tcp_all(bytes).await;
        Ok(())
    }

    /// Send `msg` over UDP to every known peer.
    pub async fn send_udp_all<T: WireMessage>(&self, msg: &T) -> LinkResult<()> {
        let bytes = self.envelope(msg)?;
        self.inner.transport.send_udp_all(bytes).await;
        Ok(())
    }
}

/// Consume transport events, decode envelopes, and re-publish.
async fn dispatch_loop(
    inner: Arc<MessengerInner>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            TransportEvent::PeerChange { peer, active } => {
                inner.emit(ObjectEvent::PeerChange { peer, active }).await;
            }
            TransportEvent::Message {
                source_ip,
                payload,
                was_udp,
            } => {
                let envelope = match Envelope::decode(payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(
                            addr = %source_ip,
                            error = %e,
                            "Dropping malformed envelope"
                        );
                        continue;
                    }
                };

                match inner
                    .registry
                    .decode(&envelope.type_tag, envelope.payload.clone())
                {
                    None => {
                        tracing::warn!(
                            addr = %source_ip,
                            tag = %envelope.type_tag,
                            "Dropping envelope with unknown type"
                        );
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            addr = %source_ip,
                            tag = %envelope.type_tag,
                            error = %e,
                            "Dropping undecodable payload"
                        );
                    }
                    Some(Ok(object)) => {
                        let meta = ObjectMeta {
                            source_ip: envelope.source_ip,
                            type_tag: envelope.type_tag,
                            was_udp,
                        };
                        tracing::trace!(
                            addr = %meta.source_ip,
                            tag = %meta.type_tag,
                            "Object received"
                        );
                        inner.emit(ObjectEvent::Object { meta, object }).await;
                    }
                }
            }
        }
    }
    tracing::debug!("Object dispatch stopped");
}
