//! Library error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use lanlink_core::WireError;

/// Errors surfaced by the transport, object, and file layers.
#[derive(Debug, Error)]
pub enum LinkError {
    /// I/O error during socket or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A received envelope or message failed to decode.
    #[error("malformed wire data: {0}")]
    Wire(#[from] WireError),

    /// No usable network interface was found at startup.
    #[error("no connected network interface")]
    NoNetworkInterface,

    /// A frame length prefix exceeded the configured maximum.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u64, max: u64 },

    /// A received envelope carried a type tag with no registered decoder.
    #[error("unknown message type: {tag}")]
    UnknownType { tag: String },

    /// The TCP connection to a peer was lost.
    #[error("connection to {addr} lost")]
    ConnectionLost { addr: String },

    /// Outbound connection attempt timed out.
    #[error("connection to {addr} timed out")]
    ConnectTimeout { addr: String },

    /// The layer has not been started, or was stopped.
    #[error("layer is not running")]
    NotRunning,

    /// A transfer to this peer is already in flight.
    #[error("transfer to {addr} already active")]
    Busy { addr: String },

    /// The operation was aborted by `stop()`.
    #[error("operation cancelled")]
    Cancelled,

    /// A source file could not be opened.
    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    /// A transfer was aborted mid-flight.
    #[error("transfer failed: {reason}")]
    TransferFailed { reason: String },

    /// A peer address string did not parse as an IPv4 address.
    #[error("invalid peer address: {addr}")]
    InvalidAddress { addr: String },

    /// A caller-supplied argument was unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An internal channel closed unexpectedly.
    #[error("internal channel closed")]
    ChannelClosed,
}

/// Result type for library operations.
pub type LinkResult<T> = Result<T, LinkError>;
