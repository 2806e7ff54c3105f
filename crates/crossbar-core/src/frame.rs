//! Unified frame representation.
//!
//! # Wire Format
//!
//! Every frame starts with a fixed header:
//!
//! ```text
//! [2 bytes] total frame length (big-endian u16, inclusive of this prefix)
//! [1 byte]  frame type
//! [4 bytes] frame id (big-endian u32)
//! ```
//!
//! followed by a type-specific body:
//!
//! ```text
//! init request (0x01) / init response (0x02):
//!   [2 bytes] protocol version
//!   [2B len][host:port]  advertised address ("0.0.0.0:0" for dial-only peers)
//!   [2B len][process name]
//!
//! call request (0x03):
//!   [1 byte]  flags (bit 0: more fragments follow)
//!   [4 bytes] ttl in milliseconds (big-endian u32)
//!   arg chunks...
//!
//! call response (0x04):
//!   [1 byte]  flags
//!   [1 byte]  ok (0 = not ok, 1 = ok)
//!   arg chunks...
//!
//! call error (0xff):
//!   [1 byte]  error code
//!   [4 bytes] id of the call request this refutes (big-endian u32)
//!   [2B len][message]
//!
//! arg chunk: [1 byte slot (1..=3)][2B len][bytes]
//! ```
//!
//! A call whose args exceed one frame spans multiple call frames sharing the
//! id; every frame but the last carries the more-fragments flag. The ttl and
//! ok fields are repeated verbatim on continuation frames and read from the
//! first. A slot's value is the concatenation of its chunks in wire order.

use bytes::Bytes;

use crate::ErrorCode;

/// Protocol version carried in init frames. Peers must agree exactly.
pub const PROTOCOL_VERSION: u16 = 2;

/// Frame id used by init request/response frames.
pub const INIT_FRAME_ID: u32 = 0;

/// Advertised address of a peer that cannot accept connections.
///
/// Connections identifying with this marker stay usable for the current
/// direction but are never stored in the peer registry.
pub const EPHEMERAL_HOST_PORT: &str = "0.0.0.0:0";

/// Fixed header: length prefix + type + id.
pub const FRAME_HEADER_LEN: usize = 7;

/// Largest frame the 16-bit length prefix can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Largest body a single frame can carry.
pub const MAX_FRAME_BODY_LEN: usize = MAX_FRAME_LEN - FRAME_HEADER_LEN;

/// Per-chunk overhead: slot byte + 16-bit length.
pub const ARG_CHUNK_HEADER_LEN: usize = 3;

/// Frame type tags on the wire.
pub(crate) mod frame_type {
    pub const INIT_REQUEST: u8 = 0x01;
    pub const INIT_RESPONSE: u8 = 0x02;
    pub const CALL_REQUEST: u8 = 0x03;
    pub const CALL_RESPONSE: u8 = 0x04;
    pub const CALL_ERROR: u8 = 0xff;
}

/// Flag bit set on call frames that have further fragments behind them.
pub(crate) const FLAG_MORE_FRAGMENTS: u8 = 0x01;

/// One of the three argument slots of a call.
///
/// Slot 1 conventionally carries the endpoint name, slot 2 an application
/// header, slot 3 the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ArgSlot {
    Arg1 = 1,
    Arg2 = 2,
    Arg3 = 3,
}

impl ArgSlot {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Arg1),
            2 => Some(Self::Arg2),
            3 => Some(Self::Arg3),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Zero-based index into `[arg1, arg2, arg3]` arrays.
    #[inline]
    pub fn index(self) -> usize {
        self as usize - 1
    }
}

/// A contiguous piece of one argument slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgChunk {
    pub slot: ArgSlot,
    pub data: Bytes,
}

impl ArgChunk {
    pub fn new(slot: ArgSlot, data: Bytes) -> Self {
        Self { slot, data }
    }

    /// Encoded size of this chunk including its header.
    pub fn encoded_len(&self) -> usize {
        ARG_CHUNK_HEADER_LEN + self.data.len()
    }
}

/// Body of an init request or init response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitBody {
    pub version: u16,
    /// The peer's advertised `host:port`, or [`EPHEMERAL_HOST_PORT`].
    pub host_port: String,
    pub process_name: String,
}

impl InitBody {
    pub fn new(host_port: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            host_port: host_port.into(),
            process_name: process_name.into(),
        }
    }

    pub(crate) fn encoded_len(&self) -> usize {
        2 + 2 + self.host_port.len() + 2 + self.process_name.len()
    }
}

/// Body of a call-request frame (initial or continuation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequestBody {
    /// More fragments of this call follow.
    pub more_fragments: bool,
    /// Time the caller is willing to wait, in milliseconds.
    pub ttl_ms: u32,
    pub chunks: Vec<ArgChunk>,
}

impl CallRequestBody {
    pub(crate) fn encoded_len(&self) -> usize {
        1 + 4 + self.chunks.iter().map(ArgChunk::encoded_len).sum::<usize>()
    }
}

/// Body of a call-response frame (initial or continuation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponseBody {
    pub more_fragments: bool,
    /// Application-level success flag. A not-ok response is still a
    /// response; transport errors travel as call-error frames instead.
    pub ok: bool,
    pub chunks: Vec<ArgChunk>,
}

impl CallResponseBody {
    pub(crate) fn encoded_len(&self) -> usize {
        1 + 1 + self.chunks.iter().map(ArgChunk::encoded_len).sum::<usize>()
    }
}

/// Body of a call-error frame, refuting a call request by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallErrorBody {
    pub code: ErrorCode,
    /// Id of the call request this error refers to.
    pub original_id: u32,
    pub message: String,
}

impl CallErrorBody {
    pub(crate) fn encoded_len(&self) -> usize {
        1 + 4 + 2 + self.message.len()
    }
}

/// Typed frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    InitRequest(InitBody),
    InitResponse(InitBody),
    CallRequest(CallRequestBody),
    CallResponse(CallResponseBody),
    CallError(CallErrorBody),
}

impl FrameBody {
    pub(crate) fn type_tag(&self) -> u8 {
        match self {
            Self::InitRequest(_) => frame_type::INIT_REQUEST,
            Self::InitResponse(_) => frame_type::INIT_RESPONSE,
            Self::CallRequest(_) => frame_type::CALL_REQUEST,
            Self::CallResponse(_) => frame_type::CALL_RESPONSE,
            Self::CallError(_) => frame_type::CALL_ERROR,
        }
    }

    pub(crate) fn encoded_len(&self) -> usize {
        match self {
            Self::InitRequest(b) | Self::InitResponse(b) => b.encoded_len(),
            Self::CallRequest(b) => b.encoded_len(),
            Self::CallResponse(b) => b.encoded_len(),
            Self::CallError(b) => b.encoded_len(),
        }
    }
}

/// Owned frame for sending, receiving, or routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Call id for call frames; [`INIT_FRAME_ID`] for init frames.
    pub id: u32,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(id: u32, body: FrameBody) -> Self {
        Self { id, body }
    }

    pub fn init_request(init: InitBody) -> Self {
        Self::new(INIT_FRAME_ID, FrameBody::InitRequest(init))
    }

    pub fn init_response(init: InitBody) -> Self {
        Self::new(INIT_FRAME_ID, FrameBody::InitResponse(init))
    }

    pub fn call_error(original_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            original_id,
            FrameBody::CallError(CallErrorBody {
                code,
                original_id,
                message: message.into(),
            }),
        )
    }

    /// Total encoded size including the length prefix.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body.encoded_len()
    }
}
