//! The ZCL1 binary framing codec.
//!
//! A ZCL1 frame is a 24-byte little-endian header followed by a
//! capability-defined payload. This crate is the allocation-free codec layer
//! (`parse`/`write_ok`/`write_error`) plus an owned [`Frame`] convenience
//! wrapper used by the higher dispatch layers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod frame;
mod header;

pub use error::WireError;
pub use frame::{parse, parse_error_payload, write_error, write_ok, ErrorPayload, Frame, ParsedFrame};
pub use header::{FrameHeader, HEADER_LEN, MAGIC, STATUS_ERR, STATUS_OK, VERSION};

/// Event-record op kinds shared by every capability's event stream, per the
/// `sys/loop` event record layout (§4.6/§6).
pub mod event {
    use zerocopy::byteorder::little_endian::{U32, U64};
    use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

    /// A ready-handle event.
    pub const KIND_READY: u32 = 1;
    /// A fired-timer event.
    pub const KIND_TIMER: u32 = 2;

    /// Readiness bit: handle is readable.
    pub const READABLE: u32 = 1;
    /// Readiness bit: handle is writable.
    pub const WRITABLE: u32 = 2;
    /// Readiness bit: peer hung up.
    pub const HUP: u32 = 4;
    /// Readiness bit: an error condition is pending.
    pub const ERROR: u32 = 8;

    /// The 32-byte wire record for one loop event.
    #[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
    #[repr(C, packed)]
    pub struct EventRecord {
        kind: U32,
        events: U32,
        handle: U32,
        reserved: U32,
        id: U64,
        timestamp: U64,
    }

    impl EventRecord {
        /// Build a new event record.
        #[must_use]
        pub fn new(kind: u32, events: u32, handle: u32, id: u64, timestamp: u64) -> Self {
            Self {
                kind: U32::new(kind),
                events: U32::new(events),
                handle: U32::new(handle),
                reserved: U32::new(0),
                id: U64::new(id),
                timestamp: U64::new(timestamp),
            }
        }

        /// `KIND_READY` or `KIND_TIMER`.
        #[must_use]
        pub fn kind(&self) -> u32 {
            self.kind.get()
        }

        /// Readiness bitmask for `KIND_READY`, unused for `KIND_TIMER`.
        #[must_use]
        pub fn events(&self) -> u32 {
            self.events.get()
        }

        /// The watched handle, for `KIND_READY` events.
        #[must_use]
        pub fn handle(&self) -> u32 {
            self.handle.get()
        }

        /// The watch id or timer id that produced this event.
        #[must_use]
        pub fn id(&self) -> u64 {
            self.id.get()
        }

        /// Monotonic timestamp in nanoseconds when the event was observed.
        #[must_use]
        pub fn timestamp(&self) -> u64 {
            self.timestamp.get()
        }
    }
}
