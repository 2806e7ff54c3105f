//! Wire error codes and codec errors.

use core::fmt;
use std::sync::Arc;

/// Error codes carried by call-error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// The call exceeded its ttl on the serving side.
    Timeout = 0x01,
    /// The call was cancelled before completion.
    Cancelled = 0x02,
    /// The peer is overloaded or out of call ids.
    Busy = 0x03,
    /// The peer refused the call outright.
    Declined = 0x04,
    /// The handler failed in an unexpected way.
    Unexpected = 0x05,
    /// The request was malformed at the application level.
    BadRequest = 0x06,
    /// The peer observed a protocol violation on this connection.
    Protocol = 0x07,
}

impl ErrorCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Timeout),
            0x02 => Some(Self::Cancelled),
            0x03 => Some(Self::Busy),
            0x04 => Some(Self::Declined),
            0x05 => Some(Self::Unexpected),
            0x06 => Some(Self::BadRequest),
            0x07 => Some(Self::Protocol),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Busy => write!(f, "busy"),
            Self::Declined => write!(f, "declined"),
            Self::Unexpected => write!(f, "unexpected error"),
            Self::BadRequest => write!(f, "bad request"),
            Self::Protocol => write!(f, "protocol error"),
        }
    }
}

/// Errors produced while encoding or decoding frames.
///
/// I/O errors are held behind an `Arc` so the owning connection can fan a
/// single read failure out to every in-flight operation.
#[derive(Debug, Clone)]
pub enum WireError {
    /// The length prefix is smaller than the fixed frame header.
    FrameTooShort { size: u16 },
    /// A frame would not fit the 16-bit length prefix.
    FrameTooLong { len: usize },
    /// The frame type tag is not one this protocol defines.
    UnknownFrameType(u8),
    /// The body ended before its declared fields did.
    Truncated,
    /// The body has bytes left over after its declared fields.
    TrailingBytes { remaining: usize },
    /// An arg chunk named a slot outside 1..=3.
    BadArgSlot(u8),
    /// An arg chunk arrived for a slot earlier than one already complete.
    OutOfOrderChunk { slot: u8 },
    /// A length-prefixed string field was not valid UTF-8.
    BadUtf8 { field: &'static str },
    /// A string field exceeds the 16-bit length prefix of its slot.
    StringTooLong { field: &'static str, len: usize },
    /// A call-error frame carried an unknown error code.
    UnknownErrorCode(u8),
    Io(Arc<std::io::Error>),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooShort { size } => write!(f, "frame too short: {size} bytes"),
            Self::FrameTooLong { len } => {
                write!(f, "frame too long: {len} bytes exceeds 16-bit length prefix")
            }
            Self::UnknownFrameType(tag) => write!(f, "unknown frame type 0x{tag:02x}"),
            Self::Truncated => write!(f, "truncated frame body"),
            Self::TrailingBytes { remaining } => {
                write!(f, "{remaining} trailing bytes after frame body")
            }
            Self::BadArgSlot(slot) => write!(f, "arg slot {slot} out of range"),
            Self::OutOfOrderChunk { slot } => {
                write!(f, "arg chunk for slot {slot} after a later slot started")
            }
            Self::BadUtf8 { field } => write!(f, "{field} is not valid UTF-8"),
            Self::StringTooLong { field, len } => {
                write!(f, "{field} of {len} bytes does not fit a 16-bit length")
            }
            Self::UnknownErrorCode(code) => write!(f, "unknown error code 0x{code:02x}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}
