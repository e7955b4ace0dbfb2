//! Primitive wire encodings.
//!
//! All integers are little-endian. Strings are UTF-8 with a u16 length
//! prefix, byte arrays carry a u32 length prefix, booleans are a single
//! 0/1 byte, and lists are a u32 element count followed by the elements.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{WireError, WireResult};

/// A message that can be carried inside an [`Envelope`](crate::Envelope).
///
/// `TYPE_TAG` is the wire-visible name used for registry dispatch on the
/// receiving side. Encoding is deterministic; fields are written in
/// declared order.
pub trait WireMessage: Send + Sync + 'static {
    /// Wire-visible type tag.
    const TYPE_TAG: &'static str;

    /// Append this message's encoding to `buf`.
    fn encode(&self, buf: &mut BytesMut) -> WireResult<()>;

    /// Decode a message from `buf`, advancing past the consumed bytes.
    fn decode(buf: &mut Bytes) -> WireResult<Self>
    where
        Self: Sized;
}

/// Encode a message into a fresh buffer.
pub fn encode_to_bytes<T: WireMessage>(msg: &T) -> WireResult<Bytes> {
    let mut buf = BytesMut::new();
    msg.encode(&mut buf)?;
    Ok(buf.freeze())
}

fn need<B: Buf>(buf: &B, n: usize, context: &'static str) -> WireResult<()> {
    if buf.remaining() < n {
        return Err(WireError::UnexpectedEof { context });
    }
    Ok(())
}

pub fn get_u8<B: Buf>(buf: &mut B, context: &'static str) -> WireResult<u8> {
    need(buf, 1, context)?;
    Ok(buf.get_u8())
}

pub fn get_u16<B: Buf>(buf: &mut B, context: &'static str) -> WireResult<u16> {
    need(buf, 2, context)?;
    Ok(buf.get_u16_le())
}

pub fn get_u32<B: Buf>(buf: &mut B, context: &'static str) -> WireResult<u32> {
    need(buf, 4, context)?;
    Ok(buf.get_u32_le())
}

pub fn get_u64<B: Buf>(buf: &mut B, context: &'static str) -> WireResult<u64> {
    need(buf, 8, context)?;
    Ok(buf.get_u64_le())
}

pub fn get_bool<B: Buf>(buf: &mut B, context: &'static str) -> WireResult<bool> {
    match get_u8(buf, context)? {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(WireError::InvalidBool { value }),
    }
}

/// Read a u16-length-prefixed UTF-8 string.
pub fn get_string<B: Buf>(buf: &mut B, context: &'static str) -> WireResult<String> {
    let len = get_u16(buf, context)? as usize;
    need(buf, len, context)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8 { context })
}

/// Read a u32-length-prefixed byte array.
///
/// On a `Bytes`-backed buffer this is a cheap slice, not a copy.
pub fn get_bytes<B: Buf>(buf: &mut B, context: &'static str) -> WireResult<Bytes> {
    let len = get_u32(buf, context)? as usize;
    need(buf, len, context)?;
    Ok(buf.copy_to_bytes(len))
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Write a u16-length-prefixed UTF-8 string.
pub fn put_string(buf: &mut BytesMut, s: &str) -> WireResult<()> {
    let len = s.len();
    if len > u16::MAX as usize {
        return Err(WireError::StringTooLong {
            len,
            max: u16::MAX as usize,
        });
    }
    buf.put_u16_le(len as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Write a u32-length-prefixed byte array.
pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_roundtrip() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(0xBEEF);
        buf.put_u32_le(0xDEAD_BEEF);
        buf.put_u64_le(0x0123_4567_89AB_CDEF);

        let mut bytes = buf.freeze();
        assert_eq!(get_u16(&mut bytes, "a").unwrap(), 0xBEEF);
        assert_eq!(get_u32(&mut bytes, "b").unwrap(), 0xDEAD_BEEF);
        assert_eq!(get_u64(&mut bytes, "c").unwrap(), 0x0123_4567_89AB_CDEF);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "hello").unwrap();

        let mut bytes = buf.freeze();
        assert_eq!(get_string(&mut bytes, "s").unwrap(), "hello");
    }

    #[test]
    fn test_string_layout_is_little_endian_prefixed() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "hi").unwrap();
        assert_eq!(&buf[..], &[0x02, 0x00, b'h', b'i']);
    }

    #[test]
    fn test_string_too_long() {
        let long = "x".repeat(u16::MAX as usize + 1);
        let mut buf = BytesMut::new();
        let err = put_string(&mut buf, &long).unwrap_err();
        assert!(matches!(err, WireError::StringTooLong { .. }));
    }

    #[test]
    fn test_string_invalid_utf8() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(2);
        buf.put_slice(&[0xFF, 0xFE]);

        let mut bytes = buf.freeze();
        let err = get_string(&mut bytes, "s").unwrap_err();
        assert_eq!(err, WireError::InvalidUtf8 { context: "s" });
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, &[1, 2, 3, 4]);

        let mut bytes = buf.freeze();
        let out = get_bytes(&mut bytes, "b").unwrap();
        assert_eq!(&out[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_bool_roundtrip() {
        let mut buf = BytesMut::new();
        put_bool(&mut buf, true);
        put_bool(&mut buf, false);

        let mut bytes = buf.freeze();
        assert!(get_bool(&mut bytes, "t").unwrap());
        assert!(!get_bool(&mut bytes, "f").unwrap());
    }

    #[test]
    fn test_bool_rejects_other_values() {
        let mut bytes = Bytes::from_static(&[2]);
        let err = get_bool(&mut bytes, "b").unwrap_err();
        assert_eq!(err, WireError::InvalidBool { value: 2 });
    }

    #[test]
    fn test_truncated_input() {
        let mut bytes = Bytes::from_static(&[0x01]);
        let err = get_u32(&mut bytes, "len").unwrap_err();
        assert_eq!(err, WireError::UnexpectedEof { context: "len" });

        // Declared length longer than the remaining buffer.
        let mut buf = BytesMut::new();
        buf.put_u16_le(10);
        buf.put_slice(b"abc");
        let mut bytes = buf.freeze();
        assert!(matches!(
            get_string(&mut bytes, "s"),
            Err(WireError::UnexpectedEof { .. })
        ));
    }
}
