//! crossbar: a bidirectional, multiplexed, framed RPC transport.
//!
//! A [`Channel`] endpoint acts concurrently as client and server over the
//! same TCP connections. Each connection carries an ordered stream of
//! length-prefixed frames implementing a small call protocol: every call has
//! a 32-bit id, three argument slots (`arg1` endpoint name, `arg2`
//! application header, `arg3` body), and exactly one completion, either an
//! ok/not-ok response or an error. Many calls are in flight on one
//! connection at a time; a periodic sweep enforces per-call timeouts and
//! kills links that show timeouts without progress.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────────────────────┐
//!            │               Channel                │
//!            ├──────────────────────────────────────┤
//!            │ listener        peer registry        │
//!            │                 host:port → conns    │
//!            └──────┬───────────────┬───────────────┘
//!                   │ accept        │ dial
//!            ┌──────▼───────────────▼───────────────┐
//!            │             Connection               │
//!            │  reader task (sole frame receiver)   │
//!            │  op tables: in/out calls by id       │
//!            │  timeout sweep task                  │
//!            └──────────────┬───────────────────────┘
//!                           │ frames
//!            ┌──────────────▼───────────────────────┐
//!            │     crossbar-core frame codec        │
//!            └──────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use crossbar::{Channel, ChannelOptions, RequestOptions};
//!
//! let server = Channel::new(ChannelOptions::new("echo-server"));
//! server.register("echo", |req, responder| async move {
//!     let _ = responder.send_ok(req.arg2.clone(), req.arg3.clone()).await;
//! })?;
//! let host_port = server.listen(0, "127.0.0.1").await?;
//!
//! let client = Channel::new(ChannelOptions::new("echo-client"));
//! let call = client.request(RequestOptions::new(host_port)).await?;
//! let response = call.send("echo", "k", "v").await.into_response()?;
//! assert!(response.ok);
//! ```
//!
//! # Error Handling
//!
//! Nothing here panics the process. Synchronous misuse (listening twice,
//! requesting on a closed channel) comes back as an `Err`; everything that
//! happens to a call in flight (timeout, peer error, connection reset)
//! arrives as the call's single [`CallOutcome`]. An application-level
//! failure is not a transport error: it is a response with `ok == false`.

#![forbid(unsafe_code)]

mod calls;
mod channel;
mod connection;
mod error;
mod handler;
mod ops;
mod options;
mod peers;

pub use calls::{
    CallOutcome, CallResponse, IncomingRequest, OutgoingCall, Responder, ResponseState,
    StreamingResponse,
};
pub use channel::Channel;
pub use connection::{ByteStream, Connection, Direction};
pub use error::ChannelError;
pub use handler::{BoxFuture, EndpointRouter, NoHandler, RequestHandler};
pub use options::{
    ChannelOptions, RequestOptions, DEFAULT_OUTGOING_REQUEST_TTL, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SERVER_TIMEOUT, DEFAULT_TIMEOUT_CHECK_INTERVAL, DEFAULT_TIMEOUT_FUZZ,
};

// Re-export the wire-level crate for fake peers in tests and advanced use.
pub use crossbar_core as core;
pub use crossbar_core::ErrorCode;
