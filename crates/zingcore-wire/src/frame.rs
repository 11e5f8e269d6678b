//! Parsing and production of ZCL1 frames.
//!
//! The free functions [`parse`], [`write_ok`] and [`write_error`] are the
//! allocation-free codec described by the wire format: they read and write
//! directly into caller-supplied buffers. [`Frame`] is a convenience owned
//! wrapper over [`bytes::Bytes`] for code that wants to hold a frame past the
//! lifetime of its source buffer (capability dispatch loops, tests).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::header::{FrameHeader, HEADER_LEN, STATUS_ERR, STATUS_OK};

/// A frame parsed out of a byte slice without copying the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedFrame<'a> {
    /// The frame header.
    pub header: FrameHeader,
    /// A view of the payload bytes trailing the header.
    pub payload: &'a [u8],
}

/// Parse a single ZCL1 frame from the front of `buf`.
///
/// Validates magic, version, and that the full frame (`24 + payload_len`
/// bytes) fits in `buf`. Returns a borrowed view; no bytes are copied.
pub fn parse(buf: &[u8]) -> Result<ParsedFrame<'_>, WireError> {
    let header = FrameHeader::parse(buf)?;
    let payload_len = header.payload_len() as usize;
    let total = HEADER_LEN.checked_add(payload_len).ok_or(WireError::Truncated)?;
    if buf.len() < total {
        return Err(WireError::Truncated);
    }
    Ok(ParsedFrame { header, payload: &buf[HEADER_LEN..total] })
}

/// Write a successful response frame into `buf`. Returns the number of bytes written.
pub fn write_ok(buf: &mut [u8], op: u16, rid: u32, payload: &[u8]) -> Result<usize, WireError> {
    let total = HEADER_LEN.checked_add(payload.len()).ok_or(WireError::BufferTooSmall)?;
    if buf.len() < total {
        return Err(WireError::BufferTooSmall);
    }
    let payload_len = u32::try_from(payload.len()).map_err(|_| WireError::BufferTooSmall)?;
    let header = FrameHeader::new(op, rid, STATUS_OK, payload_len);
    buf[..HEADER_LEN].copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
    buf[HEADER_LEN..total].copy_from_slice(payload);
    Ok(total)
}

/// Write an error response frame: status 0 with a `(trace, msg, context)`
/// length-prefixed payload triple.
pub fn write_error(
    buf: &mut [u8],
    op: u16,
    rid: u32,
    trace: &[u8],
    msg: &[u8],
    context: &[u8],
) -> Result<usize, WireError> {
    let payload_len = 12_usize
        .checked_add(trace.len())
        .and_then(|n| n.checked_add(msg.len()))
        .and_then(|n| n.checked_add(context.len()))
        .ok_or(WireError::BufferTooSmall)?;
    let total = HEADER_LEN.checked_add(payload_len).ok_or(WireError::BufferTooSmall)?;
    if buf.len() < total {
        return Err(WireError::BufferTooSmall);
    }
    let payload_len_u32 = u32::try_from(payload_len).map_err(|_| WireError::BufferTooSmall)?;
    let header = FrameHeader::new(op, rid, STATUS_ERR, payload_len_u32);
    buf[..HEADER_LEN].copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));

    let mut off = HEADER_LEN;
    off = write_len_prefixed(buf, off, trace);
    off = write_len_prefixed(buf, off, msg);
    let _ = write_len_prefixed(buf, off, context);
    Ok(total)
}

fn write_len_prefixed(buf: &mut [u8], off: usize, field: &[u8]) -> usize {
    let len = field.len() as u32;
    buf[off..off + 4].copy_from_slice(&len.to_le_bytes());
    buf[off + 4..off + 4 + field.len()].copy_from_slice(field);
    off + 4 + field.len()
}

/// The three length-prefixed fields of an error frame's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPayload<'a> {
    /// Stable short trace identifier, e.g. `"t_http_invalid"`.
    pub trace: &'a [u8],
    /// Human-readable message.
    pub msg: &'a [u8],
    /// Optional structured context.
    pub context: &'a [u8],
}

/// Decode the `(trace, msg, context)` triple out of an error frame's payload.
pub fn parse_error_payload(payload: &[u8]) -> Result<ErrorPayload<'_>, WireError> {
    let (trace, rest) = read_len_prefixed(payload)?;
    let (msg, rest) = read_len_prefixed(rest)?;
    let (context, rest) = read_len_prefixed(rest)?;
    if !rest.is_empty() {
        return Err(WireError::MalformedErrorPayload);
    }
    Ok(ErrorPayload { trace, msg, context })
}

fn read_len_prefixed(buf: &[u8]) -> Result<(&[u8], &[u8]), WireError> {
    if buf.len() < 4 {
        return Err(WireError::MalformedErrorPayload);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let rest = &buf[4..];
    if rest.len() < len {
        return Err(WireError::MalformedErrorPayload);
    }
    Ok((&rest[..len], &rest[len..]))
}

/// An owned ZCL1 frame: a header plus a shared payload buffer.
///
/// Unlike [`ParsedFrame`], this type owns its bytes (via [`Bytes`]) so it can
/// outlive the buffer it was decoded from; capability dispatch loops and
/// tests build and pass these around freely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame header.
    pub header: FrameHeader,
    /// The frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Build an owned ok-status frame.
    #[must_use]
    pub fn ok(op: u16, rid: u32, payload: Bytes) -> Self {
        let payload_len = payload.len() as u32;
        Self { header: FrameHeader::new(op, rid, STATUS_OK, payload_len), payload }
    }

    /// Build an owned error-status frame from an already-assembled payload.
    #[must_use]
    pub fn error_raw(op: u16, rid: u32, payload: Bytes) -> Self {
        let payload_len = payload.len() as u32;
        Self { header: FrameHeader::new(op, rid, STATUS_ERR, payload_len), payload }
    }

    /// Build an owned error frame from trace/msg/context strings.
    #[must_use]
    pub fn error(op: u16, rid: u32, trace: &str, msg: &str, context: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(12 + trace.len() + msg.len() + context.len());
        payload.put_u32_le(trace.len() as u32);
        payload.put_slice(trace.as_bytes());
        payload.put_u32_le(msg.len() as u32);
        payload.put_slice(msg.as_bytes());
        payload.put_u32_le(context.len() as u32);
        payload.put_slice(context);
        Self::error_raw(op, rid, payload.freeze())
    }

    /// Encode this frame onto the end of `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_slice(zerocopy::IntoBytes::as_bytes(&self.header));
        out.put_slice(&self.payload);
    }

    /// Decode an owned frame from `bytes`, copying the payload out of it.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let parsed = parse(bytes)?;
        Ok(Self { header: parsed.header, payload: Bytes::copy_from_slice(parsed.payload) })
    }
}
