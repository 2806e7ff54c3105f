//! Call fragmentation and reassembly.
//!
//! The 16-bit length prefix caps a frame at 64 KiB, so a call whose args are
//! larger spans a fragment chain: call frames sharing the id, every frame but
//! the last flagged more-fragments. [`fragment_request`]/[`fragment_response`]
//! build such chains; [`ArgAssembler`] rebuilds the three arg slots on the
//! receiving side.

use bytes::{Bytes, BytesMut};

use crate::{
    ArgChunk, ArgSlot, CallRequestBody, CallResponseBody, Frame, FrameBody, WireError,
    ARG_CHUNK_HEADER_LEN, MAX_FRAME_BODY_LEN,
};

/// Fixed body overhead of a call-request frame (flags + ttl).
const CALL_REQUEST_FIXED_LEN: usize = 5;

/// Fixed body overhead of a call-response frame (flags + ok).
const CALL_RESPONSE_FIXED_LEN: usize = 2;

/// Chunk capacity per call frame. The request overhead is the larger of the
/// two, so one budget serves both directions.
pub const FRAME_CHUNK_BUDGET: usize = MAX_FRAME_BODY_LEN - CALL_REQUEST_FIXED_LEN;

const ALL_SLOTS: [ArgSlot; 3] = [ArgSlot::Arg1, ArgSlot::Arg2, ArgSlot::Arg3];

/// Split three arg slots into per-frame chunk lists within the budget.
///
/// Always yields at least one (possibly chunkless) frame so every call emits
/// a frame even with empty args.
fn fragment_chunks(args: [Bytes; 3]) -> Vec<Vec<ArgChunk>> {
    let mut frames: Vec<Vec<ArgChunk>> = Vec::new();
    let mut current: Vec<ArgChunk> = Vec::new();
    let mut used = 0usize;

    for (slot, data) in ALL_SLOTS.into_iter().zip(args) {
        let mut offset = 0;
        while offset < data.len() {
            let space = FRAME_CHUNK_BUDGET - used;
            if space <= ARG_CHUNK_HEADER_LEN {
                frames.push(std::mem::take(&mut current));
                used = 0;
                continue;
            }
            let take = (data.len() - offset)
                .min(space - ARG_CHUNK_HEADER_LEN)
                .min(u16::MAX as usize);
            current.push(ArgChunk::new(slot, data.slice(offset..offset + take)));
            used += ARG_CHUNK_HEADER_LEN + take;
            offset += take;
        }
    }

    frames.push(current);
    frames
}

/// Build the call-request fragment chain for one outbound call.
pub fn fragment_request(id: u32, ttl_ms: u32, args: [Bytes; 3]) -> Vec<Frame> {
    let chunk_lists = fragment_chunks(args);
    let last = chunk_lists.len() - 1;
    chunk_lists
        .into_iter()
        .enumerate()
        .map(|(i, chunks)| {
            Frame::new(
                id,
                FrameBody::CallRequest(CallRequestBody {
                    more_fragments: i < last,
                    ttl_ms,
                    chunks,
                }),
            )
        })
        .collect()
}

/// Build the call-response fragment chain for one outbound response.
pub fn fragment_response(id: u32, ok: bool, args: [Bytes; 3]) -> Vec<Frame> {
    let chunk_lists = fragment_chunks(args);
    let last = chunk_lists.len() - 1;
    chunk_lists
        .into_iter()
        .enumerate()
        .map(|(i, chunks)| {
            Frame::new(
                id,
                FrameBody::CallResponse(CallResponseBody {
                    more_fragments: i < last,
                    ok,
                    chunks,
                }),
            )
        })
        .collect()
}

/// Reassembles the three arg slots of one call from its fragment chain.
///
/// Chunks must arrive in slot order: once a chunk for slot N is seen, a chunk
/// for any earlier slot is a wire error.
#[derive(Debug, Default)]
pub struct ArgAssembler {
    slots: [BytesMut; 3],
    highest_slot: u8,
    complete: bool,
}

impl ArgAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the chunks of one fragment. `last` is the inverse of the frame's
    /// more-fragments flag.
    pub fn push(&mut self, chunks: Vec<ArgChunk>, last: bool) -> Result<(), WireError> {
        for chunk in chunks {
            let slot = chunk.slot.as_u8();
            if slot < self.highest_slot {
                return Err(WireError::OutOfOrderChunk { slot });
            }
            self.highest_slot = slot;
            self.slots[chunk.slot.index()].extend_from_slice(&chunk.data);
        }
        if last {
            self.complete = true;
        }
        Ok(())
    }

    /// Whether the final fragment has been observed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Take the reassembled args. Call only once complete.
    pub fn finish(self) -> [Bytes; 3] {
        debug_assert!(self.complete, "finishing an incomplete arg assembly");
        self.slots.map(BytesMut::freeze)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned(len: usize, seed: u8) -> Bytes {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect::<Vec<u8>>()
            .into()
    }

    fn reassemble(frames: &[Frame]) -> [Bytes; 3] {
        let mut assembler = ArgAssembler::new();
        for frame in frames {
            match &frame.body {
                FrameBody::CallRequest(body) => assembler
                    .push(body.chunks.clone(), !body.more_fragments)
                    .unwrap(),
                FrameBody::CallResponse(body) => assembler
                    .push(body.chunks.clone(), !body.more_fragments)
                    .unwrap(),
                other => panic!("unexpected body {other:?}"),
            }
        }
        assert!(assembler.is_complete());
        assembler.finish()
    }

    #[test]
    fn empty_args_still_emit_one_frame() {
        let frames = fragment_request(3, 2000, [Bytes::new(), Bytes::new(), Bytes::new()]);
        assert_eq!(frames.len(), 1);
        match &frames[0].body {
            FrameBody::CallRequest(body) => {
                assert!(!body.more_fragments);
                assert!(body.chunks.is_empty());
            }
            other => panic!("unexpected body {other:?}"),
        }
        let args = reassemble(&frames);
        assert!(args.iter().all(|a| a.is_empty()));
    }

    #[test]
    fn small_call_fits_one_frame() {
        let args = [
            Bytes::from_static(b"echo"),
            Bytes::from_static(b"header"),
            Bytes::from_static(b"body"),
        ];
        let frames = fragment_request(1, 500, args.clone());
        assert_eq!(frames.len(), 1);
        assert!(frames[0].encoded_len() <= crate::MAX_FRAME_LEN);
        assert_eq!(reassemble(&frames), args);
    }

    #[test]
    fn large_args_span_frames() {
        let args = [
            Bytes::from_static(b"stream"),
            patterned(200 * 1024, 7),
            patterned(300 * 1024, 11),
        ];
        let frames = fragment_request(8, 10_000, args.clone());
        assert!(frames.len() > 1);
        for frame in &frames {
            assert!(frame.encoded_len() <= crate::MAX_FRAME_LEN);
        }
        // Only the last frame closes the chain.
        for (i, frame) in frames.iter().enumerate() {
            match &frame.body {
                FrameBody::CallRequest(body) => {
                    assert_eq!(body.more_fragments, i + 1 < frames.len());
                    assert_eq!(body.ttl_ms, 10_000);
                }
                other => panic!("unexpected body {other:?}"),
            }
        }
        assert_eq!(reassemble(&frames), args);
    }

    #[test]
    fn budget_boundary_roundtrips() {
        for len in [
            FRAME_CHUNK_BUDGET - ARG_CHUNK_HEADER_LEN - 1,
            FRAME_CHUNK_BUDGET - ARG_CHUNK_HEADER_LEN,
            FRAME_CHUNK_BUDGET - ARG_CHUNK_HEADER_LEN + 1,
        ] {
            let args = [Bytes::new(), Bytes::new(), patterned(len, 3)];
            let frames = fragment_request(2, 100, args.clone());
            for frame in &frames {
                assert!(frame.encoded_len() <= crate::MAX_FRAME_LEN, "len {len}");
            }
            assert_eq!(reassemble(&frames), args, "len {len}");
        }
    }

    #[test]
    fn response_chain_carries_ok_flag() {
        let args = [Bytes::new(), patterned(100 * 1024, 1), patterned(8, 2)];
        let frames = fragment_response(4, false, args.clone());
        assert!(frames.len() > 1);
        for frame in &frames {
            match &frame.body {
                FrameBody::CallResponse(body) => assert!(!body.ok),
                other => panic!("unexpected body {other:?}"),
            }
        }
        assert_eq!(reassemble(&frames), args);
    }

    #[test]
    fn assembler_rejects_out_of_order_slots() {
        let mut assembler = ArgAssembler::new();
        assembler
            .push(vec![ArgChunk::new(ArgSlot::Arg3, Bytes::from_static(b"x"))], false)
            .unwrap();
        let err = assembler
            .push(vec![ArgChunk::new(ArgSlot::Arg1, Bytes::from_static(b"y"))], true)
            .unwrap_err();
        assert!(matches!(err, WireError::OutOfOrderChunk { slot: 1 }));
    }
}
