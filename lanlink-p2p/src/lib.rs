//! Peer-to-peer messaging and file transfer for devices on a common IP
//! network.
//!
//! Peers discover each other by UDP broadcast, exchange typed messages
//! over TCP or UDP, and stream files of arbitrary size by chunking.
//! The crate is organized as three layers, each a strict client of the
//! one beneath:
//!
//! - [`transport`]: connection lifecycle, peer tracking, framed TCP
//!   I/O, datagram I/O, broadcast announcements
//! - [`object`]: envelope encode/decode, the type registry, dispatch
//!   by type tag
//! - [`file`]: chunked file transfer with a request/accept handshake
//!   and live progress events
//!
//! # Architecture
//!
//! Each layer runs its own tokio tasks and hands events upward through
//! channels:
//!
//! ```text
//! TransferManager (file dispatch, one streaming task per transfer)
//! └── Messenger (object dispatch)
//!     └── Transport
//!         ├── Accept loop (inbound TCP)
//!         ├── UDP receive loop
//!         └── Per-connection reader + writer tasks
//! ```
//!
//! Events flow on two paths: a lossless pipeline that connects each
//! layer to the one above (and carries TCP backpressure end to end),
//! and a lossy broadcast tap per layer for observers such as a UI.
//!
//! # Usage
//!
//! ```ignore
//! use lanlink_p2p::{LinkConfig, Messenger, Transport, TransferManager};
//!
//! let transport = Transport::new(LinkConfig::new(8080));
//! let files = TransferManager::new(Messenger::new(transport));
//! files.start().await?;
//! files.send_files("192.168.1.7", &["movie.mkv"]).await?;
//! ```

pub mod config;
pub mod error;

pub mod file;
pub mod object;
pub mod transport;

// Re-export main types
pub use config::{LinkConfig, DEFAULT_BUFFER_SIZE, DEFAULT_PORT, MAX_FRAME_BYTES};
pub use error::{LinkError, LinkResult};
pub use file::{
    Direction, DiskStorage, FileEvent, FileProgress, MemStorage, Storage, TransferManager,
};
pub use object::{Messenger, ObjectEvent, ObjectMeta, TypeRegistry};
pub use transport::{PeerSnapshot, Transport, TransportEvent};

pub use lanlink_core::{
    Envelope, FileMetadata, FilePartObj, FileReqAck, FileSendMetadata, WireError, WireMessage,
};
