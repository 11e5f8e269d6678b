//! `sys/info`: stateless host/process introspection.
//!
//! Every op is answered synchronously out of the calling thread; there is no
//! background state to hold, so a single [`SysInfoCap`] is reused verbatim by
//! every `open` call.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};
use zingcore_core::env::{Environment, SystemEnv};
use zingcore_core::registry::{cflags, CapDescriptor, OpenRequest};
use zingcore_core::{hflags, CoreError, HandleOps, Runtime};

use crate::error::CapsError;

/// `sys/info` op codes.
pub mod ops {
    /// Static host/process info: cpu count, page size, os/arch strings.
    pub const INFO: u16 = 1;
    /// Current realtime and monotonic timestamps, in nanoseconds.
    pub const TIME_NOW: u16 = 2;
    /// 32 bytes of host entropy.
    pub const RANDOM_SEED: u16 = 3;
    /// Best-effort load averages and memory totals.
    pub const STATS: u16 = 4;
}

/// `INFO` response flag bits.
pub mod info_flags {
    /// The host exposes `STATS` data (load averages, memory totals).
    pub const HAS_STATS: u32 = 0x1;
}

/// The page size assumed when the host does not expose one more precisely.
///
/// No dependency in this workspace queries the OS for the real value, so a
/// fixed 4 KiB (true for every platform the embedder currently targets) is
/// reported instead of reaching for a new `libc` dependency for one field.
const ASSUMED_PAGE_SIZE: u32 = 4096;

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// The `sys/info` capability handle.
pub struct SysInfoCap {
    env: SystemEnv,
    out: Mutex<VecDeque<u8>>,
}

impl SysInfoCap {
    fn dispatch(&self, op: u16, rid: u32, payload: &[u8]) -> Result<BytesMut, CapsError> {
        if !payload.is_empty() {
            return Err(CapsError::MalformedPayload);
        }
        let body = match op {
            ops::INFO => self.op_info(),
            ops::TIME_NOW => self.op_time_now(),
            ops::RANDOM_SEED => self.op_random_seed(),
            ops::STATS => self.op_stats(),
            _ => return Err(CapsError::Core(CoreError::Nosys)),
        };
        let mut frame = BytesMut::zeroed(zingcore_wire::HEADER_LEN + body.len());
        let n = zingcore_wire::write_ok(&mut frame, op, rid, &body)
            .map_err(|e| CapsError::Core(CoreError::Bounds(e.to_string())))?;
        frame.truncate(n);
        Ok(frame)
    }

    fn op_info(&self) -> BytesMut {
        let cpu_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as u32;
        let mut buf = BytesMut::new();
        buf.put_u32_le(cpu_count);
        buf.put_u32_le(ASSUMED_PAGE_SIZE);
        buf.put_u32_le(info_flags::HAS_STATS);
        put_str(&mut buf, std::env::consts::OS);
        put_str(&mut buf, std::env::consts::ARCH);
        put_str(&mut buf, "zingcore");
        put_str(&mut buf, &hostname());
        buf
    }

    fn op_time_now(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.env.realtime_ns());
        buf.put_u64_le(self.env.now().elapsed().as_nanos().min(u128::from(u64::MAX)) as u64);
        buf
    }

    fn op_random_seed(&self) -> BytesMut {
        let mut seed = [0_u8; 32];
        self.env.random_bytes(&mut seed);
        let mut buf = BytesMut::with_capacity(32);
        buf.put_slice(&seed);
        buf
    }

    fn op_stats(&self) -> BytesMut {
        let (load1, load5, load15) = load_averages();
        let (mem_total, mem_available) = memory_totals();
        let mut buf = BytesMut::new();
        buf.put_f64_le(load1);
        buf.put_f64_le(load5);
        buf.put_f64_le(load15);
        buf.put_u64_le(mem_total);
        buf.put_u64_le(mem_available);
        buf
    }
}

/// `uname -n`-equivalent, best-effort. Falls back to an empty string rather
/// than failing `INFO` outright when the hostname cannot be determined.
fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_default()
}

/// 1/5/15-minute load averages, when `/proc/loadavg` is readable. Zeros
/// elsewhere (the reference host considers this best-effort, not a hard
/// capability requirement).
fn load_averages() -> (f64, f64, f64) {
    let Ok(contents) = std::fs::read_to_string("/proc/loadavg") else {
        return (0.0, 0.0, 0.0);
    };
    let mut fields = contents.split_whitespace();
    let one = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let five = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let fifteen = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    (one, five, fifteen)
}

/// `(total, available)` memory in bytes, when `/proc/meminfo` is readable.
fn memory_totals() -> (u64, u64) {
    let Ok(contents) = std::fs::read_to_string("/proc/meminfo") else {
        return (0, 0);
    };
    let mut total = 0_u64;
    let mut available = 0_u64;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kib(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kib(rest);
        }
    }
    (total, available)
}

fn parse_kib(field: &str) -> u64 {
    field
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .map(|kib| kib.saturating_mul(1024))
        .unwrap_or(0)
}

impl HandleOps for SysInfoCap {
    fn read(&self, buf: &mut [u8]) -> Result<usize, CoreError> {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        if out.is_empty() {
            return Err(CoreError::Again);
        }
        let n = buf.len().min(out.len());
        for slot in buf.iter_mut().take(n) {
            *slot = out.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, CoreError> {
        let frame = zingcore_wire::parse(buf).map_err(|e| CoreError::Invalid(e.to_string()))?;
        let op = frame.header.op();
        let rid = frame.header.rid();
        let consumed = zingcore_wire::HEADER_LEN + frame.header.payload_len() as usize;
        let response = match self.dispatch(op, rid, frame.payload) {
            Ok(response) => response,
            Err(err) => {
                let mut tmp = vec![0_u8; 256 + err.to_string().len()];
                let n = zingcore_wire::write_error(
                    &mut tmp,
                    op,
                    rid,
                    err.trace().as_bytes(),
                    err.to_string().as_bytes(),
                    b"",
                )
                .unwrap_or(0);
                tmp.truncate(n);
                BytesMut::from(&tmp[..])
            },
        };
        self.out.lock().unwrap_or_else(|e| e.into_inner()).extend(response.iter().copied());
        Ok(consumed)
    }

    fn end(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// The `(kind="sys", name="info")` descriptor.
#[must_use]
pub fn descriptor() -> CapDescriptor {
    CapDescriptor {
        kind: "sys".into(),
        name: "info".into(),
        version: 1,
        flags: cflags::CAN_OPEN,
        meta: bytes::Bytes::new(),
    }
}

/// Open a `sys/info` handle. Ignores `params` (the capability takes none).
pub fn open(runtime: &Arc<Runtime>, _req: &OpenRequest<'_>) -> Result<u32, CoreError> {
    let cap = Arc::new(SysInfoCap { env: SystemEnv, out: Mutex::new(VecDeque::new()) });
    let id = runtime.handles.alloc(cap, hflags::READABLE | hflags::WRITABLE);
    Ok(id)
}
