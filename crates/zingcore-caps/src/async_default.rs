//! `async/default`: a per-handle table of named selectors invoked as
//! fire-and-forget futures that resolve by pushing an event frame.
//!
//! Every future started on a handle lives only on that handle; there is no
//! cross-handle sharing here, unlike [`event_bus`](crate::event_bus)'s
//! process-global topic table.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use bytes::{Buf, BufMut, BytesMut};
use zingcore_core::registry::{cflags, CapDescriptor, OpenRequest};
use zingcore_core::{hflags, CoreError, HandleOps, Runtime};
use std::sync::Arc;

use crate::error::CapsError;

/// `async/default` op codes.
pub mod ops {
    /// `INVOKE(selector, future_id, params)`.
    pub const INVOKE: u16 = 1;
    /// `CANCEL(future_id)`.
    pub const CANCEL: u16 = 2;
    /// `LIST() -> [selector]`.
    pub const LIST: u16 = 3;
    /// Server-pushed: the future completed successfully.
    pub const EV_FUTURE_OK: u16 = 100;
    /// Server-pushed: the future failed.
    pub const EV_FUTURE_FAIL: u16 = 101;
    /// Server-pushed: the future was cancelled.
    pub const EV_FUTURE_CANCEL: u16 = 102;
}

const BUILTIN_SELECTORS: &[&str] = &["ping.v1", "fail.v1", "hold.v1"];

#[derive(Clone, Copy, PartialEq, Eq)]
enum FutureState {
    /// `hold.v1` only: acked, never resolves until explicitly cancelled.
    Held,
}

struct State {
    out: VecDeque<u8>,
    in_flight: HashMap<u64, FutureState>,
}

/// The `async/default` capability handle.
pub struct AsyncDefaultCap {
    state: Mutex<State>,
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

impl AsyncDefaultCap {
    fn push_event(&self, op: u16, future_id: u64, extra: &[u8]) {
        let mut body = BytesMut::with_capacity(8 + extra.len());
        body.put_u64_le(future_id);
        body.put_slice(extra);
        let mut frame = BytesMut::zeroed(zingcore_wire::HEADER_LEN + body.len());
        let n = zingcore_wire::write_ok(&mut frame, op, 0, &body).unwrap_or(0);
        frame.truncate(n);
        self.state.lock().unwrap_or_else(|e| e.into_inner()).out.extend(frame.iter().copied());
    }

    fn future_ok(&self, future_id: u64, result: &[u8]) {
        let mut extra = BytesMut::new();
        put_str(&mut extra, std::str::from_utf8(result).unwrap_or(""));
        self.push_event(ops::EV_FUTURE_OK, future_id, &extra);
    }

    fn future_fail(&self, future_id: u64, trace: &str, msg: &str) {
        let mut extra = BytesMut::new();
        put_str(&mut extra, trace);
        put_str(&mut extra, msg);
        self.push_event(ops::EV_FUTURE_FAIL, future_id, &extra);
    }

    fn dispatch(&self, op: u16, rid: u32, payload: &[u8]) -> Result<BytesMut, CapsError> {
        let body = match op {
            ops::INVOKE => self.op_invoke(payload)?,
            ops::CANCEL => self.op_cancel(payload)?,
            ops::LIST => {
                if !payload.is_empty() {
                    return Err(CapsError::MalformedPayload);
                }
                self.op_list()
            },
            _ => return Err(CapsError::Core(CoreError::Nosys)),
        };
        let mut frame = BytesMut::zeroed(zingcore_wire::HEADER_LEN + body.len());
        let n = zingcore_wire::write_ok(&mut frame, op, rid, &body)
            .map_err(|e| CapsError::Core(CoreError::Bounds(e.to_string())))?;
        frame.truncate(n);
        Ok(frame)
    }

    fn op_invoke(&self, payload: &[u8]) -> Result<BytesMut, CapsError> {
        let mut p = payload;
        let selector = get_str(&mut p).ok_or(CapsError::MalformedPayload)?;
        if p.len() < 8 {
            return Err(CapsError::MalformedPayload);
        }
        let future_id = p.get_u64_le();
        let params = p.to_vec();

        if future_id == 0 {
            return Err(CapsError::ZeroId);
        }
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.in_flight.contains_key(&future_id) {
                return Err(CapsError::DuplicateFuture);
            }
            if !BUILTIN_SELECTORS.contains(&selector.as_str()) {
                drop(state);
                self.future_fail(future_id, "t_async_noent", "unknown selector");
                let mut out = BytesMut::with_capacity(4);
                out.put_u32_le(0);
                return Ok(out);
            }
            if selector == "hold.v1" {
                state.in_flight.insert(future_id, FutureState::Held);
            }
        }

        match selector.as_str() {
            "ping.v1" => self.future_ok(future_id, &params),
            "fail.v1" => self.future_fail(future_id, "t_async_invoke_fail", "fail.v1 always fails"),
            "hold.v1" => {},
            // Any other registered-but-unimplemented selector would land here;
            // none exist today beyond the three built-ins above.
            _ => self.future_fail(future_id, "t_async_no_ack", "no ack"),
        }

        let mut out = BytesMut::with_capacity(4);
        out.put_u32_le(1);
        Ok(out)
    }

    fn op_cancel(&self, payload: &[u8]) -> Result<BytesMut, CapsError> {
        if payload.len() != 8 {
            return Err(CapsError::MalformedPayload);
        }
        let future_id = (&payload[..]).get_u64_le();
        if future_id == 0 {
            return Err(CapsError::ZeroId);
        }
        let had = self.state.lock().unwrap_or_else(|e| e.into_inner()).in_flight.remove(&future_id).is_some();
        if had {
            self.push_event(ops::EV_FUTURE_CANCEL, future_id, &[]);
        }
        let mut out = BytesMut::with_capacity(1);
        out.put_u8(u8::from(had));
        Ok(out)
    }

    fn op_list(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32_le(BUILTIN_SELECTORS.len() as u32);
        for selector in BUILTIN_SELECTORS {
            put_str(&mut buf, selector);
        }
        buf
    }
}

impl HandleOps for AsyncDefaultCap {
    fn read(&self, buf: &mut [u8]) -> Result<usize, CoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.out.is_empty() {
            return Err(CoreError::Again);
        }
        let n = buf.len().min(state.out.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.out.pop_front().unwrap_or(0);
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
        self.state.lock().unwrap_or_else(|e| e.into_inner()).out.extend(response.iter().copied());
        Ok(consumed)
    }

    fn end(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// The `(kind="async", name="default")` descriptor.
#[must_use]
pub fn descriptor() -> CapDescriptor {
    CapDescriptor {
        kind: "async".into(),
        name: "default".into(),
        version: 1,
        flags: cflags::CAN_OPEN,
        meta: bytes::Bytes::new(),
    }
}

/// Open an `async/default` handle with its own private future table.
pub fn open(runtime: &Arc<Runtime>, _req: &OpenRequest<'_>) -> Result<u32, CoreError> {
    let cap =
        Arc::new(AsyncDefaultCap { state: Mutex::new(State { out: VecDeque::new(), in_flight: HashMap::new() }) });
    let id = runtime.handles.alloc(cap, hflags::READABLE | hflags::WRITABLE);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use zingcore_wire::parse;

    use super::*;

    fn make_cap() -> AsyncDefaultCap {
        AsyncDefaultCap { state: Mutex::new(State { out: VecDeque::new(), in_flight: HashMap::new() }) }
    }

    fn invoke_payload(selector: &str, future_id: u64, params: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        put_str(&mut buf, selector);
        buf.put_u64_le(future_id);
        buf.put_slice(params);
        buf
    }

    #[test]
    fn ping_resolves_ok() {
        let cap = make_cap();
        let payload = invoke_payload("ping.v1", 1, b"hi");
        cap.dispatch(ops::INVOKE, 1, &payload).unwrap();
        let mut out = vec![0_u8; 4096];
        let n = cap.read(&mut out).unwrap();
        let parsed = parse(&out[..n]).unwrap();
        assert_eq!(parsed.header.op(), ops::EV_FUTURE_OK);
    }

    #[test]
    fn fail_selector_resolves_fail() {
        let cap = make_cap();
        let payload = invoke_payload("fail.v1", 2, b"");
        cap.dispatch(ops::INVOKE, 1, &payload).unwrap();
        let mut out = vec![0_u8; 4096];
        let n = cap.read(&mut out).unwrap();
        let parsed = parse(&out[..n]).unwrap();
        assert_eq!(parsed.header.op(), ops::EV_FUTURE_FAIL);
    }

    #[test]
    fn unknown_selector_fails_with_noent_trace() {
        let cap = make_cap();
        let payload = invoke_payload("nope.v1", 3, b"");
        cap.dispatch(ops::INVOKE, 1, &payload).unwrap();
        let mut out = vec![0_u8; 4096];
        let n = cap.read(&mut out).unwrap();
        let parsed = parse(&out[..n]).unwrap();
        assert_eq!(parsed.header.op(), ops::EV_FUTURE_FAIL);
    }

    #[test]
    fn hold_then_cancel_emits_cancel_event() {
        let cap = make_cap();
        let payload = invoke_payload("hold.v1", 4, b"");
        cap.dispatch(ops::INVOKE, 1, &payload).unwrap();
        let mut out = vec![0_u8; 4096];
        assert!(matches!(cap.read(&mut out), Err(CoreError::Again)));

        let cancel_payload = 4_u64.to_le_bytes();
        cap.dispatch(ops::CANCEL, 2, &cancel_payload).unwrap();
        let n = cap.read(&mut out).unwrap();
        let parsed = parse(&out[..n]).unwrap();
        assert_eq!(parsed.header.op(), ops::EV_FUTURE_CANCEL);
    }

    #[test]
    fn duplicate_future_id_is_rejected() {
        let cap = make_cap();
        let payload = invoke_payload("hold.v1", 5, b"");
        cap.dispatch(ops::INVOKE, 1, &payload).unwrap();
        assert!(matches!(cap.dispatch(ops::INVOKE, 2, &payload), Err(CapsError::DuplicateFuture)));
    }

    #[test]
    fn list_reports_builtin_selectors() {
        let cap = make_cap();
        let frame = cap.dispatch(ops::LIST, 1, &[]).unwrap();
        let parsed = parse(&frame).unwrap();
        let mut body = parsed.payload;
        let count = body.get_u32_le();
        assert_eq!(count as usize, BUILTIN_SELECTORS.len());
    }

    #[test]
    fn descriptor_advertises_async_default() {
        let d = descriptor();
        assert_eq!(d.kind, "async");
        assert_eq!(d.name, "default");
    }
}
