//! Self-describing message envelope.
//!
//! Every payload on the wire is wrapped in an envelope carrying the
//! sender's IPv4 address and the payload's type tag. Over TCP the
//! envelope is the body of a length-prefixed frame; over UDP each
//! datagram carries exactly one envelope with no extra prefix.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireResult;
use crate::wire::{self, WireMessage};

/// Wrapper around a serialized message.
///
/// Wire layout, in order: `source_ip` (u16 LE length + UTF-8),
/// `type_tag` (u16 LE length + UTF-8), payload length (u32 LE), payload
/// bytes. Bytes after the payload are ignored on decode so future
/// revisions can append fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sender's IPv4 address, as a string.
    pub source_ip: String,
    /// Registered type tag of the payload.
    pub type_tag: String,
    /// Serialized payload of the inner message.
    pub payload: Bytes,
}

impl Envelope {
    /// Wrap an already-serialized payload.
    pub fn new(source_ip: impl Into<String>, type_tag: impl Into<String>, payload: Bytes) -> Self {
        Self {
            source_ip: source_ip.into(),
            type_tag: type_tag.into(),
            payload,
        }
    }

    /// Serialize a message and wrap it in an envelope tagged with its
    /// wire-visible type name.
    pub fn wrap<T: WireMessage>(source_ip: impl Into<String>, msg: &T) -> WireResult<Self> {
        Ok(Self::new(source_ip, T::TYPE_TAG, wire::encode_to_bytes(msg)?))
    }

    /// Encode the envelope into a single buffer.
    pub fn encode(&self) -> WireResult<Bytes> {
        let mut buf =
            BytesMut::with_capacity(self.source_ip.len() + self.type_tag.len() + self.payload.len() + 8);
        wire::put_string(&mut buf, &self.source_ip)?;
        wire::put_string(&mut buf, &self.type_tag)?;
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode an envelope from a frame or datagram body.
    pub fn decode(mut buf: Bytes) -> WireResult<Self> {
        let source_ip = wire::get_string(&mut buf, "envelope.source_ip")?;
        let type_tag = wire::get_string(&mut buf, "envelope.type_tag")?;
        let payload = wire::get_bytes(&mut buf, "envelope.payload")?;
        // Anything left in `buf` is an unknown trailing field; skip it.
        Ok(Self {
            source_ip,
            type_tag,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireError;

    #[test]
    fn test_roundtrip() {
        let env = Envelope::new("192.168.1.10", "FileReqAck", Bytes::from_static(&[1]));
        let encoded = env.encode().unwrap();
        let decoded = Envelope::decode(encoded).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_empty_payload() {
        let env = Envelope::new("10.0.0.1", "Ping", Bytes::new());
        let decoded = Envelope::decode(env.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload.len(), 0);
        assert_eq!(decoded.type_tag, "Ping");
    }

    #[test]
    fn test_exact_layout() {
        let env = Envelope::new("1.2.3.4", "T", Bytes::from_static(&[0xAA, 0xBB]));
        let encoded = env.encode().unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&[7, 0]); // source_ip length, u16 LE
        expected.extend_from_slice(b"1.2.3.4");
        expected.extend_from_slice(&[1, 0]); // type_tag length
        expected.extend_from_slice(b"T");
        expected.extend_from_slice(&[2, 0, 0, 0]); // payload length, u32 LE
        expected.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(&encoded[..], &expected[..]);
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let env = Envelope::new("1.2.3.4", "T", Bytes::from_static(b"xy"));
        let mut encoded = env.encode().unwrap().to_vec();
        encoded.extend_from_slice(&[9, 9, 9]);
        let decoded = Envelope::decode(Bytes::from(encoded)).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_truncated_is_malformed() {
        let env = Envelope::new("1.2.3.4", "T", Bytes::from_static(b"payload"));
        let encoded = env.encode().unwrap();
        for cut in [0, 3, encoded.len() - 1] {
            let err = Envelope::decode(encoded.slice(..cut)).unwrap_err();
            assert!(matches!(err, WireError::UnexpectedEof { .. }));
        }
    }
}
