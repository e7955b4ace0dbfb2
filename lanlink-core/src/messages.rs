//! File-transfer protocol messages.
//!
//! Three message types drive a transfer: [`FileSendMetadata`] announces
//! the files, [`FileReqAck`] accepts or rejects the request, and
//! [`FilePartObj`] carries one chunk of one file. The offset and
//! last-part flag travel on the wire even though a conformant sender
//! makes them derivable, so a receiver can write correctly after a
//! sender reconnects mid-stream.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireResult;
use crate::wire::{self, WireMessage};

/// Description of a single file offered for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Base name of the file, as it should appear at the receiver.
    pub file_name: String,
    /// Path of the file on the sender (informational).
    pub file_path: String,
    /// Size in bytes.
    pub file_size: u64,
}

impl FileMetadata {
    pub(crate) fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        wire::put_string(buf, &self.file_name)?;
        wire::put_string(buf, &self.file_path)?;
        buf.put_u64_le(self.file_size);
        Ok(())
    }

    pub(crate) fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(Self {
            file_name: wire::get_string(buf, "file_metadata.file_name")?,
            file_path: wire::get_string(buf, "file_metadata.file_path")?,
            file_size: wire::get_u64(buf, "file_metadata.file_size")?,
        })
    }
}

/// Transfer request: the full list of files plus the chunk size the
/// sender will use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSendMetadata {
    /// Files in the order they will be streamed.
    pub files: Vec<FileMetadata>,
    /// Payload size of each `FilePartObj` (the last part of a file may
    /// be shorter).
    pub buffer_size: u32,
    /// Sender's IPv4 address.
    pub sender_ip: String,
}

impl WireMessage for FileSendMetadata {
    const TYPE_TAG: &'static str = "FileSendMetadata";

    fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        buf.put_u32_le(self.files.len() as u32);
        for file in &self.files {
            file.encode(buf)?;
        }
        buf.put_u32_le(self.buffer_size);
        wire::put_string(buf, &self.sender_ip)?;
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        let count = wire::get_u32(buf, "file_send_metadata.files")?;
        let mut files = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            files.push(FileMetadata::decode(buf)?);
        }
        Ok(Self {
            files,
            buffer_size: wire::get_u32(buf, "file_send_metadata.buffer_size")?,
            sender_ip: wire::get_string(buf, "file_send_metadata.sender_ip")?,
        })
    }
}

/// Accept/reject answer to a [`FileSendMetadata`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileReqAck {
    pub accepted: bool,
}

impl WireMessage for FileReqAck {
    const TYPE_TAG: &'static str = "FileReqAck";

    fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        wire::put_bool(buf, self.accepted);
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(Self {
            accepted: wire::get_bool(buf, "file_req_ack.accepted")?,
        })
    }
}

/// One chunk of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePartObj {
    /// Metadata of the file this part belongs to.
    pub file_metadata: FileMetadata,
    /// Byte offset of this part within the file.
    pub offset: u64,
    /// Part payload.
    pub data: Bytes,
    /// Whether this is the final part of the file.
    pub is_last: bool,
}

impl WireMessage for FilePartObj {
    const TYPE_TAG: &'static str = "FilePartObj";

    fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        self.file_metadata.encode(buf)?;
        buf.put_u64_le(self.offset);
        wire::put_bytes(buf, &self.data);
        wire::put_bool(buf, self.is_last);
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(Self {
            file_metadata: FileMetadata::decode(buf)?,
            offset: wire::get_u64(buf, "file_part.offset")?,
            data: wire::get_bytes(buf, "file_part.data")?,
            is_last: wire::get_bool(buf, "file_part.is_last")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_to_bytes;

    fn sample_meta() -> FileMetadata {
        FileMetadata {
            file_name: "a.bin".to_string(),
            file_path: "/data/a.bin".to_string(),
            file_size: 10_000,
        }
    }

    #[test]
    fn test_send_metadata_roundtrip() {
        let msg = FileSendMetadata {
            files: vec![
                sample_meta(),
                FileMetadata {
                    file_name: "b".to_string(),
                    file_path: "b".to_string(),
                    file_size: 0,
                },
            ],
            buffer_size: 4096,
            sender_ip: "192.168.0.2".to_string(),
        };
        let mut bytes = encode_to_bytes(&msg).unwrap();
        let decoded = FileSendMetadata::decode(&mut bytes).unwrap();
        assert_eq!(decoded, msg);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_part_roundtrip() {
        let msg = FilePartObj {
            file_metadata: sample_meta(),
            offset: 8192,
            data: Bytes::from(vec![7u8; 1808]),
            is_last: true,
        };
        let mut bytes = encode_to_bytes(&msg).unwrap();
        let decoded = FilePartObj::decode(&mut bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_ack_exact_layout() {
        assert_eq!(
            &encode_to_bytes(&FileReqAck { accepted: true }).unwrap()[..],
            &[1]
        );
        assert_eq!(
            &encode_to_bytes(&FileReqAck { accepted: false }).unwrap()[..],
            &[0]
        );
    }

    #[test]
    fn test_part_exact_layout() {
        let msg = FilePartObj {
            file_metadata: FileMetadata {
                file_name: "f".to_string(),
                file_path: "p".to_string(),
                file_size: 2,
            },
            offset: 1,
            data: Bytes::from_static(&[0xCC]),
            is_last: false,
        };
        let bytes = encode_to_bytes(&msg).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&[1, 0]); // file_name length
        expected.push(b'f');
        expected.extend_from_slice(&[1, 0]); // file_path length
        expected.push(b'p');
        expected.extend_from_slice(&2u64.to_le_bytes()); // file_size
        expected.extend_from_slice(&1u64.to_le_bytes()); // offset
        expected.extend_from_slice(&[1, 0, 0, 0]); // data length, u32 LE
        expected.push(0xCC);
        expected.push(0); // is_last
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn test_truncated_part_fails() {
        let msg = FilePartObj {
            file_metadata: sample_meta(),
            offset: 0,
            data: Bytes::from_static(b"abcdef"),
            is_last: true,
        };
        let bytes = encode_to_bytes(&msg).unwrap();
        let mut cut = bytes.slice(..bytes.len() - 2);
        assert!(FilePartObj::decode(&mut cut).is_err());
    }

    #[test]
    fn test_type_tags_are_wire_visible_names() {
        assert_eq!(FileSendMetadata::TYPE_TAG, "FileSendMetadata");
        assert_eq!(FileReqAck::TYPE_TAG, "FileReqAck");
        assert_eq!(FilePartObj::TYPE_TAG, "FilePartObj");
    }
}
