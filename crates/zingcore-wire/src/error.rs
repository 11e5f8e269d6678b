//! Error types for the ZCL1 framing codec.

use thiserror::Error;

/// Failures that can occur while parsing or producing a ZCL1 frame.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum WireError {
    /// Buffer shorter than the fixed 24-byte header.
    #[error("buffer too short for a ZCL1 header")]
    ShortHeader,
    /// The four magic bytes were not `"ZCL1"`.
    #[error("invalid ZCL1 magic")]
    InvalidMagic,
    /// `version` field was not 1.
    #[error("unsupported ZCL1 version")]
    InvalidVersion,
    /// `24 + payload_len` did not fit inside the supplied buffer.
    #[error("payload length exceeds buffer")]
    Truncated,
    /// The destination buffer passed to a writer was too small.
    #[error("destination buffer too small")]
    BufferTooSmall,
    /// A length-prefixed field (trace/msg/context) overran the frame.
    #[error("malformed error payload")]
    MalformedErrorPayload,
}
