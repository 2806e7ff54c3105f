//! Call-side capabilities.
//!
//! An outbound call is a small handle over the connection: write the three
//! args, then await the single tagged outcome. An inbound call hands the
//! request handler a [`Responder`] that is consumed by the response it
//! builds, so a second response is unrepresentable rather than merely
//! refused at runtime.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbar_core::{
    fragment_response, ArgChunk, ArgSlot, CallResponseBody, Frame, FrameBody,
    ARG_CHUNK_HEADER_LEN, FRAME_CHUNK_BUDGET,
};
use tokio::sync::oneshot;

use crate::connection::ConnectionInner;
use crate::ChannelError;

/// The single completion of an outbound call.
///
/// Exactly one of these is delivered per call: a response (ok or not-ok) or
/// an error (timeout, peer call-error, connection reset). No error follows a
/// response.
#[derive(Debug)]
pub enum CallOutcome {
    Response(CallResponse),
    Error(ChannelError),
}

impl CallOutcome {
    /// Convert into a `Result`, treating any error completion as `Err`.
    pub fn into_response(self) -> Result<CallResponse, ChannelError> {
        match self {
            Self::Response(res) => Ok(res),
            Self::Error(err) => Err(err),
        }
    }
}

/// A completed response to an outbound call.
#[derive(Debug)]
pub struct CallResponse {
    /// Application-level success flag. Not-ok responses carry a
    /// human-readable message in `arg3`.
    pub ok: bool,
    pub arg2: Bytes,
    pub arg3: Bytes,
}

/// Handle for one outbound call.
///
/// Returned by [`Channel::request`](crate::Channel::request) with the entry
/// already enrolled; the ttl clock started at enroll time, not at the first
/// arg write.
pub struct OutgoingCall {
    conn: Arc<ConnectionInner>,
    id: u32,
    ttl: Duration,
    outcome: oneshot::Receiver<CallOutcome>,
    args_sent: bool,
}

impl OutgoingCall {
    pub(crate) fn new(
        conn: Arc<ConnectionInner>,
        id: u32,
        ttl: Duration,
        outcome: oneshot::Receiver<CallOutcome>,
    ) -> Self {
        Self {
            conn,
            id,
            ttl,
            outcome,
            args_sent: false,
        }
    }

    /// The call id, unique among this connection's live outbound calls.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The ttl carried on the wire.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Write the three args, fragmenting across frames as needed.
    pub async fn send_args(
        &mut self,
        arg1: impl Into<Bytes>,
        arg2: impl Into<Bytes>,
        arg3: impl Into<Bytes>,
    ) -> Result<(), ChannelError> {
        if self.args_sent {
            return Err(ChannelError::ArgsAlreadySent);
        }
        self.args_sent = true;

        let ttl_ms = self.ttl.as_millis().min(u32::MAX as u128) as u32;
        let frames = crossbar_core::fragment_request(
            self.id,
            ttl_ms,
            [arg1.into(), arg2.into(), arg3.into()],
        );
        for frame in &frames {
            self.conn.send_frame(frame).await?;
        }
        Ok(())
    }

    /// Await the call's single completion.
    ///
    /// An abandoned handle is cleaned up by the timeout sweep; there is no
    /// user-initiated cancel.
    pub async fn outcome(self) -> CallOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            // The connection went away without signalling; treat as a reset.
            Err(_) => CallOutcome::Error(ChannelError::ConnectionClosing),
        }
    }

    /// Write the args and await the outcome in one step.
    pub async fn send(
        mut self,
        arg1: impl Into<Bytes>,
        arg2: impl Into<Bytes>,
        arg3: impl Into<Bytes>,
    ) -> CallOutcome {
        if let Err(err) = self.send_args(arg1, arg2, arg3).await {
            return CallOutcome::Error(err);
        }
        self.outcome().await
    }
}

/// One inbound call, delivered to the request handler with all args
/// reassembled.
#[derive(Debug)]
pub struct IncomingRequest {
    pub id: u32,
    /// Endpoint name by convention.
    pub arg1: Bytes,
    pub arg2: Bytes,
    pub arg3: Bytes,
    /// The caller's ttl, when it advertised one.
    pub ttl: Option<Duration>,
    /// The peer's advertised `host:port`.
    pub remote_addr: String,
}

impl IncomingRequest {
    /// `arg1` as a lossy string, for endpoint dispatch and logging.
    pub fn endpoint(&self) -> String {
        String::from_utf8_lossy(&self.arg1).into_owned()
    }
}

/// Capability to answer one inbound call.
///
/// Consumed by whichever response it builds. Dropping it without responding
/// leaves the entry to the server timeout sweep.
pub struct Responder {
    conn: Arc<ConnectionInner>,
    id: u32,
    epoch: u64,
}

impl Responder {
    pub(crate) fn new(conn: Arc<ConnectionInner>, id: u32, epoch: u64) -> Self {
        Self { conn, id, epoch }
    }

    /// Reply ok with the given header and body.
    pub async fn send_ok(
        self,
        arg2: impl Into<Bytes>,
        arg3: impl Into<Bytes>,
    ) -> Result<(), ChannelError> {
        self.send_unary(true, arg2.into(), arg3.into()).await
    }

    /// Reply not-ok; `arg3` conventionally carries a human-readable message.
    pub async fn send_not_ok(
        self,
        arg2: impl Into<Bytes>,
        arg3: impl Into<Bytes>,
    ) -> Result<(), ChannelError> {
        self.send_unary(false, arg2.into(), arg3.into()).await
    }

    async fn send_unary(self, ok: bool, arg2: Bytes, arg3: Bytes) -> Result<(), ChannelError> {
        let frames = fragment_response(self.id, ok, [Bytes::new(), arg2, arg3]);
        for frame in &frames {
            self.conn.send_frame(frame).await?;
        }
        self.conn.retire_inbound(self.id, self.epoch);
        Ok(())
    }

    /// Switch to streaming: write response args incrementally, then finish.
    pub fn streaming(self, ok: bool) -> StreamingResponse {
        StreamingResponse {
            conn: self.conn,
            id: self.id,
            epoch: self.epoch,
            ok,
            state: ResponseState::Initial,
            last_slot: 0,
        }
    }
}

/// Lifecycle of a streaming response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// Nothing sent yet.
    Initial,
    /// At least one fragment is on the wire.
    Started,
}

/// A response written incrementally.
///
/// Args must be written in slot order (`arg2` before `arg3`); every write
/// puts fragments on the wire immediately. [`finish`](Self::finish) sends
/// the closing fragment exactly once and retires the call. Dropping the
/// response unfinished abandons the call to the server timeout sweep.
pub struct StreamingResponse {
    conn: Arc<ConnectionInner>,
    id: u32,
    epoch: u64,
    ok: bool,
    state: ResponseState,
    last_slot: u8,
}

impl StreamingResponse {
    pub fn state(&self) -> ResponseState {
        self.state
    }

    /// Append bytes to the response header slot.
    pub async fn write_arg2(&mut self, data: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.write_slot(ArgSlot::Arg2, data.into()).await
    }

    /// Append bytes to the response body slot.
    pub async fn write_arg3(&mut self, data: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.write_slot(ArgSlot::Arg3, data.into()).await
    }

    async fn write_slot(&mut self, slot: ArgSlot, data: Bytes) -> Result<(), ChannelError> {
        if slot.as_u8() < self.last_slot {
            return Err(ChannelError::ResponseArgOrder);
        }
        self.last_slot = slot.as_u8();
        self.state = ResponseState::Started;

        let mut offset = 0;
        // Zero-length writes still mark the slot; no frame needed until data
        // or finish.
        while offset < data.len() {
            let take = (data.len() - offset).min(FRAME_CHUNK_BUDGET - ARG_CHUNK_HEADER_LEN);
            let frame = Frame::new(
                self.id,
                FrameBody::CallResponse(CallResponseBody {
                    more_fragments: true,
                    ok: self.ok,
                    chunks: vec![ArgChunk::new(slot, data.slice(offset..offset + take))],
                }),
            );
            self.conn.send_frame(&frame).await?;
            offset += take;
        }
        Ok(())
    }

    /// Send the closing fragment and retire the call.
    pub async fn finish(self) -> Result<(), ChannelError> {
        let frame = Frame::new(
            self.id,
            FrameBody::CallResponse(CallResponseBody {
                more_fragments: false,
                ok: self.ok,
                chunks: Vec::new(),
            }),
        );
        self.conn.send_frame(&frame).await?;
        self.conn.retire_inbound(self.id, self.epoch);
        Ok(())
    }
}
