//! Per-connection operation tables.
//!
//! One pair of maps keyed by 32-bit call id tracks every call in flight on a
//! connection: outbound entries hold the caller's completion sender and
//! response reassembly state, inbound entries hold request reassembly state
//! and the epoch stamp that defuses the finish-vs-reset race. The pending
//! counters move only through the primitives here; callers never touch them
//! directly.

use std::collections::HashMap;
use std::time::Duration;

use crossbar_core::ArgAssembler;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::{CallOutcome, ChannelError};

/// One outbound call in flight.
pub(crate) struct OutboundOp {
    /// Completion sender, taken on the first (and only) signal.
    pub tx: Option<oneshot::Sender<CallOutcome>>,
    pub start: Instant,
    /// Per-call timeout; the sweep falls back to the channel default when
    /// unset.
    pub ttl: Option<Duration>,
    /// Set when the sweep signalled a timeout. The entry lingers until the
    /// next sweep so a late response can still be matched for diagnostics.
    pub timed_out: bool,
    /// Application ok flag from the first response fragment.
    pub ok: Option<bool>,
    /// Response fragments reassembled so far.
    pub assembler: ArgAssembler,
}

/// Reassembly/dispatch state of one inbound call.
pub(crate) enum InboundState {
    Reassembling {
        ttl_ms: u32,
        assembler: ArgAssembler,
    },
    /// All fragments arrived; the handler owns the call now.
    Dispatched,
}

/// One inbound call in flight.
pub(crate) struct InboundOp {
    pub start: Instant,
    /// Monotonic per-connection stamp. A response finish only retires the
    /// entry if the stamp still matches, so a reset-then-reuse of the id
    /// cannot be retired by a stale responder.
    pub epoch: u64,
    pub state: InboundState,
}

/// The inbound/outbound tables of one connection.
#[derive(Default)]
pub(crate) struct OpTables {
    out: HashMap<u32, OutboundOp>,
    inb: HashMap<u32, InboundOp>,
    out_pending: usize,
    in_pending: usize,
    next_id: u32,
    next_epoch: u64,
}

impl OpTables {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Enroll an outbound call under a freshly allocated id.
    ///
    /// The id counter wraps on 2^32; if the wrapped id collides with a live
    /// entry the enroll is refused rather than silently reusing the id.
    pub fn enroll_outbound(&mut self, op: OutboundOp) -> Result<u32, ChannelError> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.out.contains_key(&id) {
            return Err(ChannelError::IdExhausted);
        }
        self.out.insert(id, op);
        self.out_pending += 1;
        Ok(id)
    }

    pub fn outbound_mut(&mut self, id: u32) -> Option<&mut OutboundOp> {
        self.out.get_mut(&id)
    }

    pub fn pop_outbound(&mut self, id: u32) -> Option<OutboundOp> {
        let op = self.out.remove(&id);
        if op.is_some() {
            self.out_pending -= 1;
        }
        op
    }

    /// Snapshot of live outbound ids for the sweep.
    pub fn outbound_ids(&self) -> Vec<u32> {
        self.out.keys().copied().collect()
    }

    /// Enroll an inbound call. Returns false if the id is already live.
    pub fn enroll_inbound(&mut self, id: u32, op: InboundOp) -> bool {
        if self.inb.contains_key(&id) {
            return false;
        }
        self.inb.insert(id, op);
        self.in_pending += 1;
        true
    }

    pub fn has_inbound(&self, id: u32) -> bool {
        self.inb.contains_key(&id)
    }

    pub fn inbound_mut(&mut self, id: u32) -> Option<&mut InboundOp> {
        self.inb.get_mut(&id)
    }

    pub fn inbound_epoch(&self, id: u32) -> Option<u64> {
        self.inb.get(&id).map(|op| op.epoch)
    }

    pub fn pop_inbound(&mut self, id: u32) -> Option<InboundOp> {
        let op = self.inb.remove(&id);
        if op.is_some() {
            self.in_pending -= 1;
        }
        op
    }

    pub fn inbound_ids(&self) -> Vec<u32> {
        self.inb.keys().copied().collect()
    }

    /// Stamp for a new inbound entry.
    pub fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    /// Retire everything, zeroing both counters. Outbound entries are
    /// returned so the caller can signal them; inbound entries are dropped.
    pub fn clear_all(&mut self) -> Vec<(u32, OutboundOp)> {
        self.inb.clear();
        self.in_pending = 0;
        self.out_pending = 0;
        self.out.drain().collect()
    }

    pub fn out_pending(&self) -> usize {
        self.out_pending
    }

    pub fn in_pending(&self) -> usize {
        self.in_pending
    }
}
