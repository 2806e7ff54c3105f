//! Connection: one bytestream carrying multiplexed calls.
//!
//! Only the reader task receives frames; all routing happens from there.
//! Outbound call completions travel over per-call oneshot senders held in
//! the operation tables, inbound calls are dispatched to the channel's
//! handler on a fresh task, and a periodic sweep enforces per-call timeouts
//! and link liveness.
//!
//! # Lifecycle
//!
//! ```text
//! construct ── init exchange ──> identified ── reset ──> closing ──> closed
//! ```
//!
//! Teardown order is fixed: the reset (which signals every in-flight
//! outbound call exactly once) always precedes the closed notification, and
//! `reset_all` never destroys the stream itself; the fatal path destroys it
//! immediately after.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crossbar_core::{
    dump_enabled, ArgAssembler, CallErrorBody, CallRequestBody, CallResponseBody, ErrorCode, Frame,
    FrameBody, FrameReader, FrameWriter, InitBody, WireError, EPHEMERAL_HOST_PORT,
    PROTOCOL_VERSION,
};

use crate::channel::ChannelShared;
use crate::ops::{InboundOp, InboundState, OpTables, OutboundOp};
use crate::options::DEFAULT_OUTGOING_REQUEST_TTL;
use crate::{CallOutcome, CallResponse, ChannelError, IncomingRequest, OutgoingCall, Responder};

/// Anything a connection can run over: TCP sockets in production, duplex
/// pairs in tests.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Whether the local end dialed or accepted this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A live connection to one peer.
///
/// Cheap to clone; all clones share the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    /// Back-reference for handing out owning handles from `&self` methods.
    self_ref: Weak<ConnectionInner>,
    channel: Arc<ChannelShared>,
    direction: Direction,
    /// Address the socket was accepted from or dialed to.
    remote_addr: String,
    /// Registry key once stored in the peer registry.
    peer_key: Mutex<Option<String>>,
    writer: tokio::sync::Mutex<FrameWriter<WriteHalf<Box<dyn ByteStream>>>>,
    state: Mutex<ConnState>,
    /// Flips to true once the init exchange completes.
    identified_tx: watch::Sender<bool>,
    /// Cancels the reader and sweep tasks.
    shutdown: CancellationToken,
    /// Fires once teardown has finished.
    closed: CancellationToken,
}

struct ConnState {
    /// Advertised `host:port` learned in the init exchange.
    remote_name: Option<String>,
    init_done: bool,
    closing: bool,
    /// Time of the most recent sweep-observed timeout; cleared by any
    /// received frame. A sweep that finds this still set kills the link.
    last_timeout_time: Option<Instant>,
    ops: OpTables,
}

enum SweepVerdict {
    Continue,
    Stop,
    Dead,
}

impl Connection {
    /// Wire a connected bytestream into a running connection.
    ///
    /// Fails if the remote address is the channel's own `host:port`. TCP
    /// no-delay is the dial/accept site's responsibility.
    pub(crate) fn spawn(
        channel: Arc<ChannelShared>,
        stream: Box<dyn ByteStream>,
        direction: Direction,
        remote_addr: String,
    ) -> Result<Connection, ChannelError> {
        if channel.host_port().as_deref() == Some(remote_addr.as_str()) {
            return Err(ChannelError::SelfPeer {
                host_port: remote_addr,
            });
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let (identified_tx, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|self_ref| ConnectionInner {
            self_ref: self_ref.clone(),
            channel,
            direction,
            remote_addr,
            peer_key: Mutex::new(None),
            writer: tokio::sync::Mutex::new(FrameWriter::new(write_half)),
            state: Mutex::new(ConnState {
                remote_name: None,
                init_done: false,
                closing: false,
                last_timeout_time: None,
                ops: OpTables::new(),
            }),
            identified_tx,
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
        });

        let conn = Connection {
            inner: inner.clone(),
        };
        conn.inner.channel.track_connection(conn.clone());

        tokio::spawn(run_reader(inner.clone(), FrameReader::new(read_half)));
        tokio::spawn(run_sweep(inner));
        Ok(conn)
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Address the socket was accepted from or dialed to.
    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    /// The peer's advertised `host:port`, once identified.
    pub fn remote_name(&self) -> Option<String> {
        self.inner.state.lock().remote_name.clone()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.state.lock().closing
    }

    /// (inbound, outbound) operations currently in flight.
    pub fn pending(&self) -> (usize, usize) {
        let st = self.inner.state.lock();
        (st.ops.in_pending(), st.ops.out_pending())
    }

    /// Resolves once the connection has fully torn down.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Start an outbound call on this connection.
    ///
    /// Waits for the init exchange to complete, then enrolls the call. The
    /// ttl clock starts now; write the args with
    /// [`OutgoingCall::send_args`] and await the outcome.
    pub async fn request(&self, timeout: Option<Duration>) -> Result<OutgoingCall, ChannelError> {
        self.inner.request(timeout).await
    }

    pub(crate) fn set_peer_key(&self, key: &str) {
        *self.inner.peer_key.lock() = Some(key.to_string());
    }

    pub(crate) fn same_connection(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) async fn shut_down(&self, err: ChannelError) {
        self.inner.fatal(err).await;
    }
}

impl ConnectionInner {
    /// Owning handle to this connection. The weak ref always upgrades while
    /// a method is running, because methods are only reached through live
    /// handles or tasks holding one.
    fn strong(&self) -> Arc<ConnectionInner> {
        self.self_ref.upgrade().expect("connection still referenced")
    }

    /// The best name we have for the peer: advertised address once
    /// identified, socket address before that.
    fn display_remote(&self) -> String {
        self.state
            .lock()
            .remote_name
            .clone()
            .unwrap_or_else(|| self.remote_addr.clone())
    }

    fn protocol_err(&self, reason: impl Into<String>) -> ChannelError {
        ChannelError::Protocol {
            remote_name: self.remote_addr.clone(),
            reason: reason.into(),
        }
    }

    fn read_failed(&self, source: WireError) -> ChannelError {
        ChannelError::ReadFailed {
            remote_name: self.display_remote(),
            local_name: self.channel.advertised_host_port(),
            source,
        }
    }

    async fn request(&self, timeout: Option<Duration>) -> Result<OutgoingCall, ChannelError> {
        let mut identified = self.identified_tx.subscribe();
        loop {
            if *identified.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ChannelError::ConnectionClosing),
                changed = identified.changed() => {
                    if changed.is_err() {
                        return Err(ChannelError::ConnectionClosing);
                    }
                }
            }
        }

        let ttl = timeout.unwrap_or(DEFAULT_OUTGOING_REQUEST_TTL);
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut st = self.state.lock();
            if st.closing {
                return Err(ChannelError::ConnectionClosing);
            }
            st.ops.enroll_outbound(OutboundOp {
                tx: Some(tx),
                start: Instant::now(),
                ttl: Some(ttl),
                timed_out: false,
                ok: None,
                assembler: ArgAssembler::new(),
            })?
        };
        Ok(OutgoingCall::new(self.strong(), id, ttl, rx))
    }

    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<(), ChannelError> {
        if self.state.lock().closing {
            return Err(ChannelError::ConnectionClosing);
        }
        if dump_enabled() {
            tracing::debug!(target: "crossbar::dump", ">>> {} {:?}", self.remote_addr, frame);
        }

        let mut writer = self.writer.lock().await;
        match writer.write_frame(frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                drop(writer);
                let failure = match err {
                    WireError::Io(e) => ChannelError::Io(e),
                    other => ChannelError::Io(Arc::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        other,
                    ))),
                };
                let inner = self.strong();
                let cause = failure.clone();
                tokio::spawn(async move {
                    inner.fatal(cause).await;
                });
                Err(failure)
            }
        }
    }

    /// Drop the inbound entry for `id` if the epoch still matches.
    ///
    /// A response finishing after the connection was reset (or after the
    /// sweep already retired the entry) is a no-op here.
    pub(crate) fn retire_inbound(&self, id: u32, epoch: u64) -> bool {
        let mut st = self.state.lock();
        match st.ops.inbound_epoch(id) {
            Some(e) if e == epoch => {
                st.ops.pop_inbound(id);
                true
            }
            Some(_) => {
                tracing::debug!(id, "inbound op changed before response finish");
                false
            }
            None => {
                tracing::debug!(id, "inbound op already retired");
                false
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) -> Result<(), ChannelError> {
        // Progress on the wire resets link liveness.
        self.state.lock().last_timeout_time = None;

        if dump_enabled() {
            tracing::debug!(target: "crossbar::dump", "<<< {} {:?}", self.remote_addr, frame);
        }

        match frame.body {
            FrameBody::InitRequest(init) => self.handle_init_request(init).await,
            FrameBody::InitResponse(init) => self.handle_init_response(init),
            FrameBody::CallRequest(body) => self.handle_call_request(frame.id, body),
            FrameBody::CallResponse(body) => self.handle_call_response(frame.id, body),
            FrameBody::CallError(body) => self.handle_call_error(body),
        }
    }

    async fn handle_init_request(&self, init: InitBody) -> Result<(), ChannelError> {
        if init.version != PROTOCOL_VERSION {
            return Err(self.protocol_err(format!(
                "init version {} (want {PROTOCOL_VERSION})",
                init.version
            )));
        }
        {
            let mut st = self.state.lock();
            if st.init_done || self.direction == Direction::Outbound {
                return Err(self.protocol_err("unexpected init request"));
            }
            st.init_done = true;
            st.remote_name = Some(init.host_port.clone());
        }

        let reply = InitBody::new(
            self.channel.advertised_host_port(),
            self.channel.options().process_name.clone(),
        );
        self.send_frame(&Frame::init_response(reply)).await?;

        // Register reverse-callable peers; ephemeral advertisements stay
        // usable for this direction only.
        if init.host_port != EPHEMERAL_HOST_PORT {
            let conn = Connection {
                inner: self.strong(),
            };
            match self.channel.peers().insert(&init.host_port, conn) {
                Ok(()) => *self.peer_key.lock() = Some(init.host_port.clone()),
                Err(err) => {
                    tracing::warn!(host_port = %init.host_port, error = %err, "not registering peer");
                }
            }
        }

        self.identified_tx.send_replace(true);
        tracing::debug!(
            remote = %init.host_port,
            process = %init.process_name,
            "peer identified"
        );
        Ok(())
    }

    fn handle_init_response(&self, init: InitBody) -> Result<(), ChannelError> {
        if init.version != PROTOCOL_VERSION {
            return Err(self.protocol_err(format!(
                "init version {} (want {PROTOCOL_VERSION})",
                init.version
            )));
        }
        {
            let mut st = self.state.lock();
            if st.init_done || self.direction == Direction::Inbound {
                return Err(self.protocol_err("unexpected init response"));
            }
            st.init_done = true;
            st.remote_name = Some(init.host_port.clone());
        }
        self.identified_tx.send_replace(true);
        tracing::debug!(
            remote = %init.host_port,
            process = %init.process_name,
            "peer identified"
        );
        Ok(())
    }

    fn handle_call_request(&self, id: u32, body: CallRequestBody) -> Result<(), ChannelError> {
        let last = !body.more_fragments;
        let (request, epoch) = {
            let mut st = self.state.lock();
            if !st.init_done {
                return Err(self.protocol_err("call request before init"));
            }
            if st.closing {
                tracing::debug!(id, "dropping call request on closing connection");
                return Ok(());
            }

            // Enrolled on the first fragment so the server timeout covers
            // reassembly time as well.
            if !st.ops.has_inbound(id) {
                let epoch = st.ops.next_epoch();
                st.ops.enroll_inbound(
                    id,
                    InboundOp {
                        start: Instant::now(),
                        epoch,
                        state: InboundState::Reassembling {
                            ttl_ms: body.ttl_ms,
                            assembler: ArgAssembler::new(),
                        },
                    },
                );
            }

            let remote_name = st
                .remote_name
                .clone()
                .unwrap_or_else(|| self.remote_addr.clone());
            let Some(op) = st.ops.inbound_mut(id) else {
                return Ok(());
            };
            match &mut op.state {
                InboundState::Reassembling { assembler, .. } => {
                    if let Err(err) = assembler.push(body.chunks, last) {
                        return Err(self.protocol_err(format!("bad call request fragment: {err}")));
                    }
                    if !assembler.is_complete() {
                        return Ok(());
                    }
                }
                InboundState::Dispatched => {
                    return Err(self.protocol_err("call request fragment after final fragment"));
                }
            }

            let epoch = op.epoch;
            let state = std::mem::replace(&mut op.state, InboundState::Dispatched);
            let InboundState::Reassembling { ttl_ms, assembler } = state else {
                return Ok(());
            };
            let [arg1, arg2, arg3] = assembler.finish();
            let request = IncomingRequest {
                id,
                arg1,
                arg2,
                arg3,
                ttl: (ttl_ms > 0).then(|| Duration::from_millis(u64::from(ttl_ms))),
                remote_addr: remote_name,
            };
            (request, epoch)
        };

        self.dispatch(request, epoch);
        Ok(())
    }

    /// Hand a complete inbound call to the channel's handler on a fresh
    /// task, so user code never runs on the frame-decode stack and a
    /// panicking handler cannot tear down the reader.
    fn dispatch(&self, request: IncomingRequest, epoch: u64) {
        let id = request.id;
        let handler = self.channel.handler();
        let responder = Responder::new(self.strong(), id, epoch);
        let inner = self.strong();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(handler.handle_request(request, responder))
                .catch_unwind()
                .await;
            if result.is_err() {
                tracing::warn!(id, "request handler panicked");
                if inner.retire_inbound(id, epoch) {
                    let frame = Frame::call_error(id, ErrorCode::Unexpected, "handler failed");
                    if let Err(err) = inner.send_frame(&frame).await {
                        tracing::debug!(id, error = %err, "could not report handler failure");
                    }
                }
            }
        });
    }

    fn handle_call_response(&self, id: u32, body: CallResponseBody) -> Result<(), ChannelError> {
        let last = !body.more_fragments;
        let mut st = self.state.lock();
        if !st.init_done {
            return Err(self.protocol_err("call response before init"));
        }
        let Some(op) = st.ops.outbound_mut(id) else {
            tracing::debug!(id, "dropping response for unknown call");
            return Ok(());
        };
        if op.ok.is_none() {
            op.ok = Some(body.ok);
        }
        if let Err(err) = op.assembler.push(body.chunks, last) {
            return Err(self.protocol_err(format!("bad call response fragment: {err}")));
        }
        if !last {
            return Ok(());
        }

        let Some(mut op) = st.ops.pop_outbound(id) else {
            return Ok(());
        };
        drop(st);

        if op.timed_out {
            // The sweep already signalled the caller; the entry lingered so
            // this late response could still be matched.
            tracing::debug!(id, "response arrived after call timed out");
            return Ok(());
        }
        let ok = op.ok.unwrap_or(false);
        let [_arg1, arg2, arg3] = std::mem::take(&mut op.assembler).finish();
        if let Some(tx) = op.tx.take() {
            let _ = tx.send(CallOutcome::Response(CallResponse { ok, arg2, arg3 }));
        }
        Ok(())
    }

    fn handle_call_error(&self, body: CallErrorBody) -> Result<(), ChannelError> {
        let mut st = self.state.lock();
        if !st.init_done {
            return Err(self.protocol_err("call error before init"));
        }
        let Some(mut op) = st.ops.pop_outbound(body.original_id) else {
            tracing::debug!(
                id = body.original_id,
                code = %body.code,
                "dropping error for unknown call"
            );
            return Ok(());
        };
        drop(st);

        if op.timed_out {
            tracing::debug!(id = body.original_id, "error arrived after call timed out");
            return Ok(());
        }
        if let Some(tx) = op.tx.take() {
            let _ = tx.send(CallOutcome::Error(ChannelError::Peer {
                code: body.code,
                message: body.message,
            }));
        }
        Ok(())
    }

    /// One pass of the timeout sweep.
    fn sweep_once(&self) -> SweepVerdict {
        let now = Instant::now();
        let req_default = self.channel.options().req_timeout_default;
        let server_default = self.channel.options().server_timeout_default;

        let mut timed_out = Vec::new();
        let mut dead = false;
        {
            let mut st = self.state.lock();
            if st.closing {
                return SweepVerdict::Stop;
            }
            if st.last_timeout_time.is_some() {
                // A whole sweep interval passed with timeouts and no frames.
                dead = true;
            } else {
                let mut saw_timeout = false;
                for id in st.ops.outbound_ids() {
                    let Some(op) = st.ops.outbound_mut(id) else {
                        continue;
                    };
                    if op.timed_out {
                        st.ops.pop_outbound(id);
                        tracing::debug!(id, "dropping lingering timed-out call");
                        continue;
                    }
                    let timeout = op.ttl.unwrap_or(req_default);
                    if now.saturating_duration_since(op.start) > timeout {
                        op.timed_out = true;
                        if let Some(tx) = op.tx.take() {
                            timed_out.push((id, tx));
                        }
                        saw_timeout = true;
                    }
                }
                if saw_timeout {
                    st.last_timeout_time = Some(now);
                }

                for id in st.ops.inbound_ids() {
                    let expired = st
                        .ops
                        .inbound_mut(id)
                        .map(|op| now.saturating_duration_since(op.start) > server_default)
                        .unwrap_or(false);
                    if expired {
                        st.ops.pop_inbound(id);
                        tracing::debug!(id, "dropping timed-out inbound call");
                    }
                }
            }
        }

        for (id, tx) in timed_out {
            tracing::debug!(id, "call timed out");
            let _ = tx.send(CallOutcome::Error(ChannelError::TimedOut));
        }
        if dead {
            SweepVerdict::Dead
        } else {
            SweepVerdict::Continue
        }
    }

    /// Reset and destroy the connection. Idempotent.
    pub(crate) async fn fatal(&self, err: ChannelError) {
        if !self.reset_all(err) {
            return;
        }
        self.destroy().await;
    }

    /// Abandon every in-flight operation: inbound entries silently, outbound
    /// entries with `err`. Does not destroy the stream; [`Self::destroy`]
    /// follows on the fatal path.
    fn reset_all(&self, err: ChannelError) -> bool {
        let out_ops = {
            let mut st = self.state.lock();
            if st.closing {
                return false;
            }
            st.closing = true;
            st.ops.clear_all()
        };
        self.shutdown.cancel();
        tracing::debug!(
            remote = %self.remote_addr,
            error = %err,
            outstanding = out_ops.len(),
            "connection reset"
        );
        for (id, mut op) in out_ops {
            match op.tx.take() {
                Some(tx) => {
                    let _ = tx.send(CallOutcome::Error(err.clone()));
                }
                None => tracing::debug!(id, "reset of already timed-out call"),
            }
        }
        true
    }

    /// Shut the stream down and unregister. The closed notification fires
    /// last.
    async fn destroy(&self) {
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        let key = self.peer_key.lock().take();
        if let Some(key) = key {
            let conn = Connection {
                inner: self.strong(),
            };
            self.channel.peers().remove(&key, &conn);
        }
        self.channel.untrack_connection(self);
        self.closed.cancel();
    }
}

async fn run_reader(
    inner: Arc<ConnectionInner>,
    mut reader: FrameReader<ReadHalf<Box<dyn ByteStream>>>,
) {
    if inner.direction == Direction::Outbound {
        let init = InitBody::new(
            inner.channel.advertised_host_port(),
            inner.channel.options().process_name.clone(),
        );
        if let Err(err) = inner.send_frame(&Frame::init_request(init)).await {
            inner.fatal(err).await;
            return;
        }
    }

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            result = reader.read_frame() => match result {
                Ok(Some(frame)) => {
                    if let Err(err) = inner.handle_frame(frame).await {
                        inner.fatal(err).await;
                        return;
                    }
                }
                Ok(None) => {
                    let remote_name = inner.display_remote();
                    inner
                        .fatal(ChannelError::SocketClosed { remote_name })
                        .await;
                    return;
                }
                Err(err) => {
                    let err = inner.read_failed(err);
                    inner.fatal(err).await;
                    return;
                }
            }
        }
    }
}

async fn run_sweep(inner: Arc<ConnectionInner>) {
    let base = inner.channel.options().timeout_check_interval;
    let fuzz = inner.channel.options().timeout_fuzz;
    let mut rng = match inner.channel.options().rng_seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    };

    loop {
        let interval = sweep_interval(base, fuzz, &mut rng);
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match inner.sweep_once() {
            SweepVerdict::Continue => {}
            SweepVerdict::Stop => return,
            SweepVerdict::Dead => {
                let remote_name = inner.display_remote();
                tracing::warn!(remote = %remote_name, "link saw only timeouts for a full sweep");
                inner
                    .fatal(ChannelError::ConnectionDead { remote_name })
                    .await;
                return;
            }
        }
    }
}

/// `base - fuzz/2 + rand(0..fuzz)`, so sweeps across connections do not
/// align.
fn sweep_interval(base: Duration, fuzz: Duration, rng: &mut SmallRng) -> Duration {
    let fuzz_ms = fuzz.as_millis() as u64;
    if fuzz_ms == 0 {
        return base;
    }
    base.saturating_sub(fuzz / 2) + Duration::from_millis(rng.gen_range(0..fuzz_ms))
}
