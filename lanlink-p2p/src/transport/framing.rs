//! Length-prefixed frame codec.
//!
//! Frames on a TCP connection are:
//! - 4 bytes: little-endian payload length
//! - N bytes: payload (one envelope)
//!
//! UDP datagrams are not framed; the datagram boundary stands in for the
//! length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{LinkError, LinkResult};

/// Header size: 4 bytes of length.
const HEADER_SIZE: usize = 4;

/// Codec for length-prefixed frames carrying opaque payloads.
#[derive(Debug)]
pub struct FrameCodec {
    /// Maximum accepted payload length.
    max_frame_bytes: usize,
    /// Expected length of the current frame (if the header has been read).
    current_length: Option<usize>,
}

impl FrameCodec {
    /// Create a codec that rejects frames larger than `max_frame_bytes`.
    pub fn new(max_frame_bytes: u32) -> Self {
        Self {
            max_frame_bytes: max_frame_bytes as usize,
            current_length: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> LinkResult<Option<Self::Item>> {
        if self.current_length.is_none() {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let length = u32::from_le_bytes(src[0..HEADER_SIZE].try_into().unwrap()) as usize;

            // Reject before reserving anything so a hostile header cannot
            // force a huge allocation.
            if length > self.max_frame_bytes {
                return Err(LinkError::FrameTooLarge {
                    size: length as u64,
                    max: self.max_frame_bytes as u64,
                });
            }

            self.current_length = Some(length);
        }

        let length = self.current_length.unwrap();

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();
        self.current_length = None;

        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = LinkError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> LinkResult<()> {
        if payload.len() > self.max_frame_bytes {
            return Err(LinkError::FrameTooLarge {
                size: payload.len() as u64,
                max: self.max_frame_bytes as u64,
            });
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}
