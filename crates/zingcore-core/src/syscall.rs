//! The six-entry-point syscall surface: `read/write/end/ctl/alloc/free/telemetry`.

use bytes::{BufMut, BytesMut};
use zingcore_wire::{parse, write_ok, HEADER_LEN};

use crate::error::CoreError;
use crate::runtime::Runtime;

/// `ctl` op implementing `CAPS_LIST`.
pub const CTL_OP_CAPS_LIST: u16 = 1;

/// `abi_version() -> u32`.
pub fn abi_version(runtime: &Runtime) -> u32 {
    if let Some(f) = runtime.host_overrides().abi_version {
        return f();
    }
    1
}

/// `read(h, dst) -> n | ERR`. Prefers a host override, else the handle's ops.
pub fn read(runtime: &Runtime, handle: u32, dst: &mut [u8]) -> Result<usize, CoreError> {
    if let Some(f) = runtime.host_overrides().read {
        return f(handle, dst);
    }
    runtime.handles.lookup(handle)?.read(dst)
}

/// `write(h, src) -> n | ERR`.
pub fn write(runtime: &Runtime, handle: u32, src: &[u8]) -> Result<usize, CoreError> {
    if let Some(f) = runtime.host_overrides().write {
        return f(handle, src);
    }
    runtime.handles.lookup(handle)?.write(src)
}

/// `end(h) -> 0 | ERR`. Invokes `ops.end` then releases the slot.
pub fn end(runtime: &Runtime, handle: u32) -> Result<(), CoreError> {
    if let Some(f) = runtime.host_overrides().end {
        f(handle)?;
        return runtime.handles.release(handle);
    }
    let ops = runtime.handles.lookup(handle)?;
    ops.end()?;
    runtime.handles.release(handle)
}

/// `alloc(size) -> ptr`. Forwards to the host; there is no handle-level
/// fallback.
pub fn alloc(runtime: &Runtime, size: u32) -> Result<u64, CoreError> {
    match runtime.host_overrides().alloc {
        Some(f) => f(size),
        None => Err(CoreError::Nosys),
    }
}

/// `free(ptr) -> 0 | ERR`.
pub fn free(runtime: &Runtime, ptr: u64) -> Result<(), CoreError> {
    match runtime.host_overrides().free {
        Some(f) => f(ptr),
        None => Err(CoreError::Nosys),
    }
}

/// `telemetry(topic, msg) -> 0`. Fire-and-forget; absence of an override is
/// not an error.
pub fn telemetry(runtime: &Runtime, topic: &str, msg: &[u8]) {
    if let Some(f) = runtime.host_overrides().telemetry {
        f(topic, msg);
    }
}

/// `ctl(req_buf, resp_buf) -> bytes_written | ERR`.
///
/// Parses a ZCL1 frame from `req_buf` and currently implements exactly
/// `CAPS_LIST`, writing a ZCL1 response frame into `resp_buf`.
pub fn ctl(runtime: &Runtime, req_buf: &[u8], resp_buf: &mut [u8]) -> Result<usize, CoreError> {
    let frame = parse(req_buf).map_err(|e| CoreError::Invalid(e.to_string()))?;
    match frame.header.op() {
        CTL_OP_CAPS_LIST => {
            let payload = encode_caps_list(runtime);
            write_ok(resp_buf, CTL_OP_CAPS_LIST, frame.header.rid(), &payload)
                .map_err(|e| CoreError::Bounds(e.to_string()))
        },
        _ => Err(CoreError::Nosys),
    }
}

fn encode_caps_list(runtime: &Runtime) -> BytesMut {
    let descriptors = runtime.registry.list();
    let mut payload = BytesMut::with_capacity(HEADER_LEN);
    payload.put_u32_le(1); // version
    payload.put_u32_le(descriptors.len() as u32);
    for d in descriptors {
        put_str(&mut payload, &d.kind);
        put_str(&mut payload, &d.name);
        payload.put_u32_le(d.flags);
        payload.put_u32_le(d.meta.len() as u32);
        payload.put_slice(&d.meta);
    }
    payload
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use zingcore_wire::write_ok;

    use super::*;
    use crate::registry::{cflags, CapDescriptor, OpenRequest};

    #[test]
    fn caps_list_includes_registered_capability() {
        let runtime = Runtime::new_native();
        runtime
            .registry
            .register(
                CapDescriptor {
                    kind: "sys".into(),
                    name: "loop".into(),
                    version: 1,
                    flags: cflags::CAN_OPEN,
                    meta: Bytes::new(),
                },
                Arc::new(|_rt: &Arc<Runtime>, _req: &OpenRequest<'_>| Ok(3)),
            )
            .unwrap();

        let mut req = [0_u8; 24];
        write_ok(&mut req, CTL_OP_CAPS_LIST, 1, &[]).unwrap();
        let mut resp = [0_u8; 256];
        let n = ctl(&runtime, &req, &mut resp).unwrap();
        let parsed = parse(&resp[..n]).unwrap();
        assert!(parsed.header.is_ok());
        assert_eq!(&parsed.payload[8..11], b"sys");
    }

    #[test]
    fn unknown_ctl_op_is_nosys() {
        let runtime = Runtime::new_native();
        let mut req = [0_u8; 24];
        write_ok(&mut req, 999, 1, &[]).unwrap();
        let mut resp = [0_u8; 64];
        assert_eq!(ctl(&runtime, &req, &mut resp), Err(CoreError::Nosys));
    }

    #[test]
    fn alloc_without_override_is_nosys() {
        let runtime = Runtime::new_native();
        assert_eq!(alloc(&runtime, 16), Err(CoreError::Nosys));
    }
}
