//! Frame codec: bytes to frames and back.
//!
//! The pure [`encode_frame`]/[`decode_frame`] pair works on buffers and is
//! what the unit tests exercise. [`FrameReader`]/[`FrameWriter`] wrap the
//! split halves of a bytestream and move whole frames in arrival order;
//! backpressure is inherited from the underlying stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::{frame_type, FLAG_MORE_FRAGMENTS};
use crate::{
    ArgChunk, ArgSlot, CallErrorBody, CallRequestBody, CallResponseBody, ErrorCode, Frame,
    FrameBody, InitBody, WireError, FRAME_HEADER_LEN, MAX_FRAME_LEN,
};

/// Whether frame dumping was requested through the `CROSSBAR_DEBUG` env list.
///
/// The owning connection tees each frame it reads or writes to the log,
/// prefixed with `<<< remoteAddr` / `>>> remoteAddr`, when the
/// comma-separated `CROSSBAR_DEBUG` list contains `dump`.
pub fn dump_enabled() -> bool {
    std::env::var("CROSSBAR_DEBUG")
        .map(|v| v.split(',').any(|name| name.trim() == "dump"))
        .unwrap_or(false)
}

/// Encode one frame, appending it to `dst`.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), WireError> {
    let total = frame.encoded_len();
    if total > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLong { len: total });
    }

    dst.reserve(total);
    dst.put_u16(total as u16);
    dst.put_u8(frame.body.type_tag());
    dst.put_u32(frame.id);

    match &frame.body {
        FrameBody::InitRequest(init) | FrameBody::InitResponse(init) => {
            dst.put_u16(init.version);
            put_string(dst, "host:port", &init.host_port)?;
            put_string(dst, "process name", &init.process_name)?;
        }
        FrameBody::CallRequest(body) => {
            dst.put_u8(if body.more_fragments { FLAG_MORE_FRAGMENTS } else { 0 });
            dst.put_u32(body.ttl_ms);
            put_chunks(dst, &body.chunks);
        }
        FrameBody::CallResponse(body) => {
            dst.put_u8(if body.more_fragments { FLAG_MORE_FRAGMENTS } else { 0 });
            dst.put_u8(u8::from(body.ok));
            put_chunks(dst, &body.chunks);
        }
        FrameBody::CallError(body) => {
            dst.put_u8(body.code.as_u8());
            dst.put_u32(body.original_id);
            put_string(dst, "error message", &body.message)?;
        }
    }
    Ok(())
}

fn put_string(dst: &mut BytesMut, field: &'static str, value: &str) -> Result<(), WireError> {
    if value.len() > u16::MAX as usize {
        return Err(WireError::StringTooLong {
            field,
            len: value.len(),
        });
    }
    dst.put_u16(value.len() as u16);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_chunks(dst: &mut BytesMut, chunks: &[ArgChunk]) {
    for chunk in chunks {
        dst.put_u8(chunk.slot.as_u8());
        dst.put_u16(chunk.data.len() as u16);
        dst.put_slice(&chunk.data);
    }
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not yet hold a complete frame; the
/// caller accumulates more bytes and retries. Consumes the frame's bytes on
/// success.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
    if src.len() < 2 {
        return Ok(None);
    }
    let size = u16::from_be_bytes([src[0], src[1]]);
    if (size as usize) < FRAME_HEADER_LEN {
        return Err(WireError::FrameTooShort { size });
    }
    if src.len() < size as usize {
        return Ok(None);
    }

    let mut buf = src.split_to(size as usize).freeze();
    buf.advance(2);
    let tag = buf.get_u8();
    let id = buf.get_u32();
    decode_body(tag, id, buf).map(Some)
}

pub(crate) fn decode_body(tag: u8, id: u32, mut buf: Bytes) -> Result<Frame, WireError> {
    let body = match tag {
        frame_type::INIT_REQUEST => FrameBody::InitRequest(get_init(&mut buf)?),
        frame_type::INIT_RESPONSE => FrameBody::InitResponse(get_init(&mut buf)?),
        frame_type::CALL_REQUEST => {
            let flags = get_u8(&mut buf)?;
            let ttl_ms = get_u32(&mut buf)?;
            FrameBody::CallRequest(CallRequestBody {
                more_fragments: flags & FLAG_MORE_FRAGMENTS != 0,
                ttl_ms,
                chunks: get_chunks(&mut buf)?,
            })
        }
        frame_type::CALL_RESPONSE => {
            let flags = get_u8(&mut buf)?;
            let ok = get_u8(&mut buf)?;
            FrameBody::CallResponse(CallResponseBody {
                more_fragments: flags & FLAG_MORE_FRAGMENTS != 0,
                ok: ok != 0,
                chunks: get_chunks(&mut buf)?,
            })
        }
        frame_type::CALL_ERROR => {
            let raw_code = get_u8(&mut buf)?;
            let code = ErrorCode::from_u8(raw_code).ok_or(WireError::UnknownErrorCode(raw_code))?;
            let original_id = get_u32(&mut buf)?;
            let message = get_string(&mut buf, "error message")?;
            FrameBody::CallError(CallErrorBody {
                code,
                original_id,
                message,
            })
        }
        other => return Err(WireError::UnknownFrameType(other)),
    };

    if buf.has_remaining() {
        return Err(WireError::TrailingBytes {
            remaining: buf.remaining(),
        });
    }
    Ok(Frame::new(id, body))
}

fn get_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_string(buf: &mut Bytes, field: &'static str) -> Result<String, WireError> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::BadUtf8 { field })
}

fn get_init(buf: &mut Bytes) -> Result<InitBody, WireError> {
    let version = get_u16(buf)?;
    let host_port = get_string(buf, "host:port")?;
    let process_name = get_string(buf, "process name")?;
    Ok(InitBody {
        version,
        host_port,
        process_name,
    })
}

fn get_chunks(buf: &mut Bytes) -> Result<Vec<ArgChunk>, WireError> {
    let mut chunks = Vec::new();
    while buf.has_remaining() {
        let raw_slot = get_u8(buf)?;
        let slot = ArgSlot::from_u8(raw_slot).ok_or(WireError::BadArgSlot(raw_slot))?;
        let len = get_u16(buf)? as usize;
        if buf.remaining() < len {
            return Err(WireError::Truncated);
        }
        // copy_to_bytes on Bytes slices without copying
        let data = buf.copy_to_bytes(len);
        chunks.push(ArgChunk { slot, data });
    }
    Ok(chunks)
}

/// Reads whole frames off the read half of a bytestream.
pub struct FrameReader<R> {
    io: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R) -> Self {
        Self { io }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary. EOF inside a
    /// frame body is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, WireError> {
        let mut prefix = [0u8; 2];
        match self.io.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let size = u16::from_be_bytes(prefix);
        if (size as usize) < FRAME_HEADER_LEN {
            return Err(WireError::FrameTooShort { size });
        }

        let mut rest = vec![0u8; size as usize - 2];
        self.io.read_exact(&mut rest).await?;

        let mut buf = Bytes::from(rest);
        let tag = buf.get_u8();
        let id = buf.get_u32();
        decode_body(tag, id, buf).map(Some)
    }
}

/// Writes whole frames to the write half of a bytestream, flushing each.
pub struct FrameWriter<W> {
    io: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W) -> Self {
        Self {
            io,
            buf: BytesMut::new(),
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), WireError> {
        self.buf.clear();
        encode_frame(frame, &mut self.buf)?;
        self.io.write_all(&self.buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Shut the write half down, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<(), std::io::Error> {
        self.io.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        assert_eq!(buf.len(), frame.encoded_len());
        let decoded = decode_frame(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn init_roundtrip() {
        let frame = Frame::init_request(InitBody::new("10.0.0.1:4040", "worker"));
        assert_eq!(roundtrip(frame.clone()), frame);

        let frame = Frame::init_response(InitBody::new("0.0.0.0:0", ""));
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn call_request_roundtrip() {
        let frame = Frame::new(
            7,
            FrameBody::CallRequest(CallRequestBody {
                more_fragments: true,
                ttl_ms: 1500,
                chunks: vec![
                    ArgChunk::new(ArgSlot::Arg1, Bytes::from_static(b"echo")),
                    ArgChunk::new(ArgSlot::Arg2, Bytes::from_static(b"k")),
                    ArgChunk::new(ArgSlot::Arg3, Bytes::from_static(b"v")),
                ],
            }),
        );
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn call_response_roundtrip() {
        let frame = Frame::new(
            9,
            FrameBody::CallResponse(CallResponseBody {
                more_fragments: false,
                ok: false,
                chunks: vec![ArgChunk::new(
                    ArgSlot::Arg3,
                    Bytes::from_static(b"no handler defined"),
                )],
            }),
        );
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn call_error_roundtrip() {
        let frame = Frame::call_error(42, ErrorCode::Busy, "out of call ids");
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn decode_needs_complete_frame() {
        let frame = Frame::call_error(1, ErrorCode::Declined, "later");
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();

        // Feed the bytes one at a time; only the final byte completes a frame.
        let full = buf.split().freeze();
        let mut partial = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            partial.put_u8(*byte);
            let decoded = decode_frame(&mut partial).unwrap();
            if i + 1 < full.len() {
                assert!(decoded.is_none(), "decoded early at byte {i}");
            } else {
                assert_eq!(decoded.unwrap(), frame);
            }
        }
    }

    #[test]
    fn decode_rejects_short_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u16(3);
        buf.put_u8(0);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(WireError::FrameTooShort { size: 3 })
        ));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u16(FRAME_HEADER_LEN as u16);
        buf.put_u8(0x77);
        buf.put_u32(1);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(WireError::UnknownFrameType(0x77))
        ));
    }

    #[test]
    fn decode_rejects_truncated_body() {
        // Call request whose declared chunk extends past the frame end.
        let mut buf = BytesMut::new();
        buf.put_u16((FRAME_HEADER_LEN + 5 + 3 + 1) as u16);
        buf.put_u8(0x03);
        buf.put_u32(5);
        buf.put_u8(0); // flags
        buf.put_u32(1000); // ttl
        buf.put_u8(1); // slot
        buf.put_u16(300); // chunk len, but only 1 byte follows
        buf.put_u8(0xaa);
        assert!(matches!(decode_frame(&mut buf), Err(WireError::Truncated)));
    }

    #[test]
    fn decode_rejects_bad_arg_slot() {
        let mut buf = BytesMut::new();
        buf.put_u16((FRAME_HEADER_LEN + 5 + 3) as u16);
        buf.put_u8(0x03);
        buf.put_u32(5);
        buf.put_u8(0);
        buf.put_u32(1000);
        buf.put_u8(9); // slot out of range
        buf.put_u16(0);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(WireError::BadArgSlot(9))
        ));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut buf = BytesMut::new();
        let body = CallErrorBody {
            code: ErrorCode::Timeout,
            original_id: 2,
            message: String::new(),
        };
        let total = FRAME_HEADER_LEN + body.encoded_len() + 1;
        buf.put_u16(total as u16);
        buf.put_u8(0xff);
        buf.put_u32(2);
        buf.put_u8(ErrorCode::Timeout.as_u8());
        buf.put_u32(2);
        buf.put_u16(0);
        buf.put_u8(0xee); // stray
        assert!(matches!(
            decode_frame(&mut buf),
            Err(WireError::TrailingBytes { remaining: 1 })
        ));
    }

    #[tokio::test]
    async fn reader_writer_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let (read_b, _write_b) = tokio::io::split(b);
        let (_read_a, write_a) = tokio::io::split(a);

        let mut writer = FrameWriter::new(write_a);
        let mut reader = FrameReader::new(read_b);

        let frames = vec![
            Frame::init_request(InitBody::new("127.0.0.1:9000", "svc")),
            Frame::new(
                1,
                FrameBody::CallRequest(CallRequestBody {
                    more_fragments: false,
                    ttl_ms: 2000,
                    chunks: vec![ArgChunk::new(ArgSlot::Arg1, Bytes::from_static(b"ping"))],
                }),
            ),
        ];

        for frame in &frames {
            writer.write_frame(frame).await.unwrap();
        }
        for frame in &frames {
            let got = reader.read_frame().await.unwrap().unwrap();
            assert_eq!(&got, frame);
        }
    }

    #[tokio::test]
    async fn reader_reports_clean_eof() {
        let (a, b) = tokio::io::duplex(64);
        let (read_b, _wb) = tokio::io::split(b);
        let mut reader = FrameReader::new(read_b);
        drop(a);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_errors_on_mid_frame_eof() {
        let (a, b) = tokio::io::duplex(64);
        let (read_b, _wb) = tokio::io::split(b);
        let (_ra, mut write_a) = tokio::io::split(a);

        // A length prefix promising more than we ever send.
        write_a.write_all(&[0x00, 0x20, 0x03]).await.unwrap();
        write_a.shutdown().await.unwrap();
        drop(write_a);

        let mut reader = FrameReader::new(read_b);
        assert!(reader.read_frame().await.is_err());
    }
}
