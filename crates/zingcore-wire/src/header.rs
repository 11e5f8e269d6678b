//! The fixed 24-byte ZCL1 header.

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::WireError;

/// Magic bytes identifying a ZCL1 frame: `"ZCL1"`.
pub const MAGIC: [u8; 4] = *b"ZCL1";
/// The only wire version this codec understands.
pub const VERSION: u16 = 1;
/// Size in bytes of [`FrameHeader`] on the wire.
pub const HEADER_LEN: usize = 24;

/// Status value for a successful response frame.
pub const STATUS_OK: u32 = 1;
/// Status value for an error response frame.
pub const STATUS_ERR: u32 = 0;

/// The 24-byte ZCL1 frame header, little-endian on the wire.
///
/// Field layout: `magic[4] version:u16 op:u16 rid:u32 status:u32 reserved:u32 payload_len:u32`.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C, packed)]
pub struct FrameHeader {
    magic: [u8; 4],
    version: U16,
    op: U16,
    rid: U32,
    status: U32,
    reserved: U32,
    payload_len: U32,
}

impl FrameHeader {
    /// Build a new header with the given op, request id, status, and payload length.
    #[must_use]
    pub fn new(op: u16, rid: u32, status: u32, payload_len: u32) -> Self {
        Self {
            magic: MAGIC,
            version: U16::new(VERSION),
            op: U16::new(op),
            rid: U32::new(rid),
            status: U32::new(status),
            reserved: U32::new(0),
            payload_len: U32::new(payload_len),
        }
    }

    /// Parse and validate a header from the front of `buf`.
    ///
    /// Does not check that the payload actually follows; callers combine this
    /// with a length check against the full buffer.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::ShortHeader);
        }
        let header =
            Self::read_from_bytes(&buf[..HEADER_LEN]).map_err(|_| WireError::ShortHeader)?;
        if header.magic != MAGIC {
            return Err(WireError::InvalidMagic);
        }
        if header.version.get() != VERSION {
            return Err(WireError::InvalidVersion);
        }
        Ok(header)
    }

    /// The protocol version; always 1 for a validly parsed header.
    #[must_use]
    pub fn version(&self) -> u16 {
        self.version.get()
    }

    /// Capability-defined operation code.
    #[must_use]
    pub fn op(&self) -> u16 {
        self.op.get()
    }

    /// Request id, echoed back by the matching response frame.
    #[must_use]
    pub fn rid(&self) -> u32 {
        self.rid.get()
    }

    /// `1` for ok, `0` for error.
    #[must_use]
    pub fn status(&self) -> u32 {
        self.status.get()
    }

    /// Whether this frame represents a successful response.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status() == STATUS_OK
    }

    /// Length of the payload trailing this header.
    #[must_use]
    pub fn payload_len(&self) -> u32 {
        self.payload_len.get()
    }
}

impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("version", &self.version())
            .field("op", &self.op())
            .field("rid", &self.rid())
            .field("status", &self.status())
            .field("payload_len", &self.payload_len())
            .finish()
    }
}

impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.magic == other.magic
            && self.version() == other.version()
            && self.op() == other.op()
            && self.rid() == other.rid()
            && self.status() == other.status()
            && self.payload_len() == other.payload_len()
    }
}
impl Eq for FrameHeader {}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn header_round_trip_via_bytes() {
        let header = FrameHeader::new(7, 42, STATUS_OK, 100);
        let bytes = header.as_bytes();
        let parsed = FrameHeader::parse(bytes).expect("should parse");
        assert_eq!(parsed, header);
    }

    #[test]
    fn reject_short_buffer() {
        let buf = [0_u8; 10];
        assert_eq!(FrameHeader::parse(&buf), Err(WireError::ShortHeader));
    }

    #[test]
    fn reject_invalid_magic() {
        let mut bytes = FrameHeader::new(1, 1, STATUS_OK, 0).as_bytes().to_vec();
        bytes[0] = b'X';
        assert_eq!(FrameHeader::parse(&bytes), Err(WireError::InvalidMagic));
    }

    #[test]
    fn reject_invalid_version() {
        let mut bytes = FrameHeader::new(1, 1, STATUS_OK, 0).as_bytes().to_vec();
        bytes[4] = 2;
        bytes[5] = 0;
        assert_eq!(FrameHeader::parse(&bytes), Err(WireError::InvalidVersion));
    }

    proptest! {
        #[test]
        fn header_accessors(op: u16, rid: u32, status: bool, payload_len: u32) {
            let status_val = u32::from(status);
            let header = FrameHeader::new(op, rid, status_val, payload_len);
            prop_assert_eq!(header.op(), op);
            prop_assert_eq!(header.rid(), rid);
            prop_assert_eq!(header.status(), status_val);
            prop_assert_eq!(header.payload_len(), payload_len);
            prop_assert_eq!(header.version(), VERSION);

            let parsed = FrameHeader::parse(header.as_bytes()).unwrap();
            prop_assert_eq!(parsed, header);
        }
    }
}
