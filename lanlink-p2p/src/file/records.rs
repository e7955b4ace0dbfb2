//! Per-transfer state.

use std::fmt;
use std::path::PathBuf;

use lanlink_core::FileMetadata;

use super::storage::{ReadStream, WriteStream};

/// Which side of a transfer a progress event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sending => write!(f, "sending"),
            Direction::Receiving => write!(f, "receiving"),
        }
    }
}

/// Progress of one file in one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProgress {
    pub direction: Direction,
    pub file_name: String,
    /// Total size of the file in bytes.
    pub file_length: u64,
    /// Bytes read (sending) or written (receiving) so far.
    pub bytes_processed: u64,
}

impl FileProgress {
    /// Completed fraction in `[0.0, 1.0]`. An empty file counts as
    /// complete.
    pub fn percent(&self) -> f64 {
        if self.file_length == 0 {
            1.0
        } else {
            self.bytes_processed as f64 / self.file_length as f64
        }
    }
}

/// Lifecycle of an outgoing transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendState {
    /// Request sent, waiting for the receiver's answer.
    AwaitingAck,
    /// Receiver accepted; parts are being pushed.
    Streaming,
    /// Every part was sent.
    Done,
    /// Receiver declined the request.
    Rejected,
}

impl fmt::Display for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendState::AwaitingAck => write!(f, "awaiting_ack"),
            SendState::Streaming => write!(f, "streaming"),
            SendState::Done => write!(f, "done"),
            SendState::Rejected => write!(f, "rejected"),
        }
    }
}

/// One file being read and pushed to a peer.
pub(crate) struct OutboundFile {
    pub metadata: FileMetadata,
    pub reader: Box<dyn ReadStream>,
}

/// One outgoing request, at most one per target address.
pub(crate) struct SendRecord {
    pub target_ip: String,
    pub buffer_size: u32,
    pub state: SendState,
    /// Taken by the streaming task once the request is accepted.
    pub files: Option<Vec<OutboundFile>>,
}

impl SendRecord {
    pub fn new(target_ip: String, buffer_size: u32) -> Self {
        Self {
            target_ip,
            buffer_size,
            state: SendState::AwaitingAck,
            files: None,
        }
    }

    pub fn transition_to(&mut self, state: SendState) {
        tracing::debug!(
            target = %self.target_ip,
            from = %self.state,
            to = %state,
            "Send record state change"
        );
        self.state = state;
    }
}

/// One file being written as parts arrive.
pub(crate) struct InboundFile {
    pub metadata: FileMetadata,
    /// Closed (set to `None`) when the last part lands.
    pub writer: Option<Box<dyn WriteStream>>,
    /// Destination path under the temp directory.
    pub path: PathBuf,
    pub received: u64,
    pub done: bool,
}

/// One incoming request, indexed by sender address.
pub(crate) struct ReceiveRecord {
    pub sender_ip: String,
    pub files: Vec<InboundFile>,
}

impl ReceiveRecord {
    /// Find the file a part belongs to. Name and size must both match.
    pub fn find_file(&mut self, metadata: &FileMetadata) -> Option<&mut InboundFile> {
        self.files.iter_mut().find(|f| {
            f.metadata.file_name == metadata.file_name
                && f.metadata.file_size == metadata.file_size
        })
    }

    /// Whether every file in the record finished.
    pub fn is_complete(&self) -> bool {
        self.files.iter().all(|f| f.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(length: u64, processed: u64) -> FileProgress {
        FileProgress {
            direction: Direction::Receiving,
            file_name: "f".to_string(),
            file_length: length,
            bytes_processed: processed,
        }
    }

    #[test]
    fn test_percent() {
        assert_eq!(progress(200, 50).percent(), 0.25);
        assert_eq!(progress(200, 200).percent(), 1.0);
        assert_eq!(progress(200, 0).percent(), 0.0);
    }

    #[test]
    fn test_percent_empty_file_is_complete() {
        assert_eq!(progress(0, 0).percent(), 1.0);
    }

    #[test]
    fn test_find_file_matches_name_and_size() {
        let meta = |name: &str, size: u64| FileMetadata {
            file_name: name.to_string(),
            file_path: name.to_string(),
            file_size: size,
        };
        let mut record = ReceiveRecord {
            sender_ip: "10.0.0.9".to_string(),
            files: vec![InboundFile {
                metadata: meta("a", 100),
                writer: None,
                path: PathBuf::from("temp/a"),
                received: 0,
                done: false,
            }],
        };

        assert!(record.find_file(&meta("a", 100)).is_some());
        assert!(record.find_file(&meta("a", 99)).is_none());
        assert!(record.find_file(&meta("b", 100)).is_none());
        assert!(!record.is_complete());

        record.files[0].done = true;
        assert!(record.is_complete());
    }
}
