//! Wire format for the lanlink protocol.
//!
//! This crate defines the byte-level encoding shared by every lanlink
//! node:
//!
//! - Primitive encodings (little-endian integers, length-prefixed strings
//!   and byte arrays) and the [`WireMessage`] trait
//! - The self-describing [`Envelope`] that wraps every payload with its
//!   sender address and type tag
//! - The file-transfer protocol messages
//!
//! The encoding is deterministic: identical values always produce
//! identical bytes, and fields are written in declared order. Nothing in
//! this crate performs I/O; the `lanlink-p2p` crate moves these bytes
//! over sockets.

pub mod envelope;
pub mod error;
pub mod messages;
pub mod wire;

// Re-export main types
pub use envelope::Envelope;
pub use error::WireError;
pub use messages::{FileMetadata, FilePartObj, FileReqAck, FileSendMetadata};
pub use wire::WireMessage;
