//! Drives `net/http` over a real loopback socket: listen, send a literal
//! `GET` request from a plain `std::net::TcpStream`, answer it with
//! `RESPOND_INLINE`, and check the client sees the inlined body. Mirrors the
//! reference HTTP-GET-inline scenario.
//!
//! The control-channel op codes below are the wire protocol's, not a Rust
//! API — `net/http`'s `wire` module is a private implementation detail, so a
//! driver (this test, same as any other guest) addresses the capability by
//! its documented op numbers.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use zingcore_core::registry::OpenRequest;
use zingcore_core::CoreError;
use zingcore_harness::build_runtime;

const OP_LISTEN: u16 = 1;
const OP_RESPOND_INLINE: u16 = 5;
const OP_EV_REQUEST: u16 = 100;

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(u32::try_from(s.len()).unwrap());
    buf.put_slice(s.as_bytes());
}

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
fn http_get_inline_response_reaches_the_client() {
    let runtime = build_runtime().unwrap();
    let http_id = runtime.registry.open(&runtime, &OpenRequest { kind: "net", name: "http", version: 1, params: &[] }).unwrap();
    let http_ops = runtime.handles.lookup(http_id).unwrap();

    let mut listen_payload = BytesMut::new();
    listen_payload.put_u32_le(0); // ephemeral port
    listen_payload.put_u32_le(0); // flags
    put_str(&mut listen_payload, "127.0.0.1");
    let mut req_buf = vec![0_u8; 24 + listen_payload.len()];
    let n = zingcore_wire::write_ok(&mut req_buf, OP_LISTEN, 1, &listen_payload).unwrap();
    http_ops.write(&req_buf[..n]).unwrap();

    let mut resp_buf = [0_u8; 256];
    let n = retry(|| http_ops.read(&mut resp_buf), Duration::from_secs(5));
    let parsed = zingcore_wire::parse(&resp_buf[..n]).unwrap();
    assert!(parsed.header.is_ok());
    let mut body = parsed.payload;
    let _listener_id = body.get_u32_le();
    let port = u16::try_from(body.get_u32_le()).unwrap();

    let mut client = retry(
        || TcpStream::connect(("127.0.0.1", port)).map_err(|e| CoreError::Io(e.to_string())),
        Duration::from_secs(5),
    );
    client.write_all(b"GET /hello?x=1 HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();

    let mut ev_buf = [0_u8; 4096];
    let n = retry(|| http_ops.read(&mut ev_buf), Duration::from_secs(5));
    let parsed = zingcore_wire::parse(&ev_buf[..n]).unwrap();
    assert_eq!(parsed.header.op(), OP_EV_REQUEST);
    let rid = parsed.header.rid();

    let mut respond_payload = BytesMut::new();
    respond_payload.put_u32_le(rid);
    respond_payload.put_u32_le(200);
    respond_payload.put_u32_le(1); // header count
    put_str(&mut respond_payload, "content-type");
    put_str(&mut respond_payload, "text/plain");
    respond_payload.put_u32_le(5); // body len
    respond_payload.put_slice(b"world");
    let mut respond_buf = vec![0_u8; 24 + respond_payload.len()];
    let n = zingcore_wire::write_ok(&mut respond_buf, OP_RESPOND_INLINE, 2, &respond_payload).unwrap();
    http_ops.write(&respond_buf[..n]).unwrap();

    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut text = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                text.extend_from_slice(&chunk[..n]);
                if text.ends_with(b"world") {
                    break;
                }
            },
            Err(e) => panic!("client read failed: {e}"),
        }
    }
    let text = String::from_utf8(text).unwrap();
    assert!(text.starts_with("HTTP/1.1 200"), "unexpected status line: {text}");
    assert!(text.ends_with("world"), "body not inlined: {text}");
}
