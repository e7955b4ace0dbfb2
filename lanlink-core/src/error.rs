//! Wire-format error types.

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The buffer ended before the declared field was complete.
    #[error("unexpected end of input while reading {context}")]
    UnexpectedEof { context: &'static str },

    /// A length-prefixed string did not contain valid UTF-8.
    #[error("invalid UTF-8 in {context}")]
    InvalidUtf8 { context: &'static str },

    /// A string was too long for its u16 length prefix.
    #[error("string too long for wire encoding: {len} bytes (max {max})")]
    StringTooLong { len: usize, max: usize },

    /// A boolean byte held a value other than 0 or 1.
    #[error("invalid boolean byte: {value}")]
    InvalidBool { value: u8 },
}

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;
