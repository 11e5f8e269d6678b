//! Drives `net/tcp` over a real loopback socket: bind an ephemeral listener,
//! connect, and round-trip a `ping`/`pong` payload. Mirrors the reference
//! TCP echo scenario.

use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use zingcore_core::registry::OpenRequest;
use zingcore_core::CoreError;
use zingcore_harness::build_runtime;

const CTL_OP_LOCAL_PORT: u32 = 1;
const LISTEN: u32 = 0x1;

fn encode_tcp_params(host: &str, port: u16, flags: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32_le(u32::try_from(host.len()).unwrap());
    buf.put_slice(host.as_bytes());
    buf.put_u32_le(u32::from(port));
    buf.put_u32_le(flags);
    buf.to_vec()
}

/// Retries `f` until it stops returning [`CoreError::Again`] or `timeout`
/// elapses. Standing in for `sys/loop`-driven readiness in a thread-based
/// test: the sockets are real and nonblocking, only the wait is a poll loop.
fn retry<T>(mut f: impl FnMut() -> Result<T, CoreError>, timeout: Duration) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        match f() {
            Ok(v) => return v,
            Err(CoreError::Again) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
            Err(e) => panic!("operation did not complete within {timeout:?}: {e:?}"),
        }
    }
}

#[test]
fn tcp_echo_over_loopback() {
    let runtime = build_runtime().unwrap();

    let listener = runtime
        .registry
        .open(
            &runtime,
            &OpenRequest { kind: "net", name: "tcp", version: 1, params: &encode_tcp_params("127.0.0.1", 0, LISTEN) },
        )
        .unwrap();
    let listener_ops = runtime.handles.lookup(listener).unwrap();

    let mut port_buf = Vec::new();
    listener_ops.ctl(&CTL_OP_LOCAL_PORT.to_le_bytes(), &mut port_buf).unwrap();
    let port = u16::try_from(u32::from_le_bytes(port_buf[..4].try_into().unwrap())).unwrap();

    let client = runtime
        .registry
        .open(&runtime, &OpenRequest { kind: "net", name: "tcp", version: 1, params: &encode_tcp_params("127.0.0.1", port, 0) })
        .unwrap();
    let client_ops = runtime.handles.lookup(client).unwrap();

    let mut accept_buf = [0_u8; 32];
    let n = retry(|| listener_ops.read(&mut accept_buf), Duration::from_secs(5));
    assert_eq!(n, 32, "one accept record");
    let server_handle = u32::from_le_bytes(accept_buf[0..4].try_into().unwrap());
    let server_ops = runtime.handles.lookup(server_handle).unwrap();

    retry(|| client_ops.write(b"ping"), Duration::from_secs(5));

    let mut buf = [0_u8; 16];
    let n = retry(|| server_ops.read(&mut buf), Duration::from_secs(5));
    assert_eq!(&buf[..n], b"ping");

    retry(|| server_ops.write(b"pong"), Duration::from_secs(5));

    let n = retry(|| client_ops.read(&mut buf), Duration::from_secs(5));
    assert_eq!(&buf[..n], b"pong");
}
