//! crossbar-core: Wire-level types for the crossbar RPC transport.
//!
//! This crate defines:
//! - The frame model ([`Frame`], [`FrameBody`], init/call/error bodies)
//! - The frame codec ([`encode_frame`], [`decode_frame`], [`FrameReader`],
//!   [`FrameWriter`])
//! - Call fragmentation and reassembly ([`fragment_request`],
//!   [`fragment_response`], [`ArgAssembler`])
//! - Wire error codes and codec errors ([`ErrorCode`], [`WireError`])
//!
//! The session layer (connections, operation tables, the peer registry)
//! lives in the `crossbar` crate. Nothing here knows about calls in flight;
//! this crate only moves well-formed frames between byte streams and typed
//! values.

#![forbid(unsafe_code)]

mod codec;
mod error;
mod fragment;
mod frame;

pub use codec::*;
pub use error::*;
pub use fragment::*;
pub use frame::*;
