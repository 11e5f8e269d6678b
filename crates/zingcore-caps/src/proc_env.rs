//! `proc/env`: stateless access to the runtime's immutable argv/env snapshot.
//!
//! The snapshot is captured once at [`Runtime::new_native`] and never
//! refreshed; these ops never touch the real OS environment after startup,
//! matching the runtime-binding write-once contract.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, BytesMut};
use zingcore_core::registry::{cflags, CapDescriptor, OpenRequest};
use zingcore_core::{hflags, CoreError, HandleOps, Runtime};

use crate::error::CapsError;

/// `proc/env` op codes.
pub mod ops {
    /// Every captured argv entry, in order.
    pub const ARGV: u16 = 1;
    /// `ENV_GET(name) -> value`, `E_NOENT` if unset at startup.
    pub const ENV_GET: u16 = 2;
    /// Every captured `(key, value)` pair.
    pub const ENV_LIST: u16 = 3;
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut &[u8]) -> Option<String> {
    if buf.len() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;
    if buf.len() < len {
        return None;
    }
    let s = std::str::from_utf8(&buf[..len]).ok()?.to_string();
    buf.advance(len);
    Some(s)
}

/// The `proc/env` capability handle.
pub struct ProcEnvCap {
    runtime: Arc<Runtime>,
    out: Mutex<VecDeque<u8>>,
}

impl ProcEnvCap {
    fn dispatch(&self, op: u16, rid: u32, payload: &[u8]) -> Result<BytesMut, CapsError> {
        let body = match op {
            ops::ARGV => {
                if !payload.is_empty() {
                    return Err(CapsError::MalformedPayload);
                }
                self.op_argv()
            },
            ops::ENV_GET => self.op_env_get(payload)?,
            ops::ENV_LIST => {
                if !payload.is_empty() {
                    return Err(CapsError::MalformedPayload);
                }
                self.op_env_list()
            },
            _ => return Err(CapsError::Core(CoreError::Nosys)),
        };
        let mut frame = BytesMut::zeroed(zingcore_wire::HEADER_LEN + body.len());
        let n = zingcore_wire::write_ok(&mut frame, op, rid, &body)
            .map_err(|e| CapsError::Core(CoreError::Bounds(e.to_string())))?;
        frame.truncate(n);
        Ok(frame)
    }

    fn op_argv(&self) -> BytesMut {
        let argv = self.runtime.argv();
        let mut buf = BytesMut::new();
        buf.put_u32_le(argv.len() as u32);
        for arg in argv {
            put_str(&mut buf, arg);
        }
        buf
    }

    fn op_env_get(&self, payload: &[u8]) -> Result<BytesMut, CapsError> {
        let mut p = payload;
        let name = get_str(&mut p).ok_or(CapsError::MalformedPayload)?;
        if !p.is_empty() {
            return Err(CapsError::MalformedPayload);
        }
        let value = self.runtime.env().iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str());
        let Some(value) = value else {
            return Err(CapsError::Core(CoreError::Noent(format!("no such env var: {name}"))));
        };
        let mut buf = BytesMut::new();
        put_str(&mut buf, value);
        Ok(buf)
    }

    fn op_env_list(&self) -> BytesMut {
        let env = self.runtime.env();
        let mut buf = BytesMut::new();
        buf.put_u32_le(env.len() as u32);
        for (key, value) in env {
            put_str(&mut buf, key);
            put_str(&mut buf, value);
        }
        buf
    }
}

impl HandleOps for ProcEnvCap {
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

/// The `(kind="proc", name="env")` descriptor.
#[must_use]
pub fn descriptor() -> CapDescriptor {
    CapDescriptor {
        kind: "proc".into(),
        name: "env".into(),
        version: 1,
        flags: cflags::CAN_OPEN,
        meta: bytes::Bytes::new(),
    }
}

/// Open a `proc/env` handle over `runtime`'s startup argv/env snapshot.
pub fn open(runtime: &Arc<Runtime>, _req: &OpenRequest<'_>) -> Result<u32, CoreError> {
    let cap = Arc::new(ProcEnvCap { runtime: runtime.clone(), out: Mutex::new(VecDeque::new()) });
    let id = runtime.handles.alloc(cap, hflags::READABLE | hflags::WRITABLE);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use zingcore_wire::{parse, write_ok};

    use super::*;

    fn make_cap(runtime: &Arc<Runtime>) -> ProcEnvCap {
        ProcEnvCap { runtime: runtime.clone(), out: Mutex::new(VecDeque::new()) }
    }

    #[test]
    fn env_get_finds_a_captured_variable() {
        std::env::set_var("ZINGCORE_CAPS_TEST_VAR", "present");
        let runtime = Arc::new(Runtime::new_native());
        let cap = make_cap(&runtime);

        let mut payload = BytesMut::new();
        put_str(&mut payload, "ZINGCORE_CAPS_TEST_VAR");
        let frame = cap.dispatch(ops::ENV_GET, 1, &payload).unwrap();
        let parsed = parse(&frame).unwrap();
        assert!(parsed.header.is_ok());
        let mut body = parsed.payload;
        assert_eq!(get_str(&mut body).unwrap(), "present");
    }

    #[test]
    fn env_get_missing_variable_is_noent() {
        let runtime = Arc::new(Runtime::new_native());
        let cap = make_cap(&runtime);
        let mut payload = BytesMut::new();
        put_str(&mut payload, "ZINGCORE_CAPS_TEST_VAR_DOES_NOT_EXIST");
        assert!(matches!(cap.dispatch(ops::ENV_GET, 1, &payload), Err(CapsError::Core(CoreError::Noent(_)))));
    }

    #[test]
    fn argv_reports_captured_entries() {
        let runtime = Arc::new(Runtime::new_native());
        let cap = make_cap(&runtime);
        let frame = cap.dispatch(ops::ARGV, 1, &[]).unwrap();
        let parsed = parse(&frame).unwrap();
        let mut body = parsed.payload;
        let count = body.get_u32_le();
        assert_eq!(count as usize, runtime.argv().len());
    }

    #[test]
    fn env_list_roundtrips_through_write() {
        let runtime = Arc::new(Runtime::new_native());
        let id = open(&runtime, &OpenRequest { kind: "proc", name: "env", version: 1, params: &[] }).unwrap();
        let handle_ops = runtime.handles.lookup(id).unwrap();
        let mut req = vec![0_u8; zingcore_wire::HEADER_LEN];
        let n = write_ok(&mut req, ops::ENV_LIST, 1, &[]).unwrap();
        handle_ops.write(&req[..n]).unwrap();
        let mut out = vec![0_u8; 1 << 16];
        let read_n = handle_ops.read(&mut out).unwrap();
        let parsed = parse(&out[..read_n]).unwrap();
        assert!(parsed.header.is_ok());
    }
}
