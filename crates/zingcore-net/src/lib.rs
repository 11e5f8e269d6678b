//! `net/tcp`: nonblocking TCP connect/listen/accept.
//!
//! A stream handle tracks whether its connect is still in flight
//! (`connecting`); the first `read`/`write` after the connect resolves
//! confirms it via `SO_ERROR` and `peer_addr()`. A listener handle's `read`
//! drains pending connections as a batch of fixed-size accept records
//! rather than returning one handle at a time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod allowlist;
mod error;

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;
use zingcore_core::handle::Pollable;
use zingcore_core::registry::{cflags, CapDescriptor, OpenRequest};
use zingcore_core::{hflags, CoreError, HandleOps, PollOps, Runtime};

pub use error::map_io_error;

/// `open` parameter flag bits.
pub mod open_flags {
    /// Bind and listen instead of connecting.
    pub const LISTEN: u32 = 0x1;
    /// `SO_REUSEADDR`.
    pub const REUSEADDR: u32 = 0x2;
    /// `SO_REUSEPORT` (best-effort; ignored where unsupported).
    pub const REUSEPORT: u32 = 0x4;
    /// `IPV6_V6ONLY` for IPv6 listeners.
    pub const IPV6ONLY: u32 = 0x8;
    /// `TCP_NODELAY`.
    pub const NODELAY: u32 = 0x10;
    /// `SO_KEEPALIVE`.
    pub const KEEPALIVE: u32 = 0x20;

    pub(crate) const KNOWN: u32 = LISTEN | REUSEADDR | REUSEPORT | IPV6ONLY | NODELAY | KEEPALIVE;
}

/// Stream `ctl` op: half-close the write side (`shutdown(SHUT_WR)`).
pub const CTL_OP_SHUT_WR: u32 = 1;

/// Listener `ctl` op: read back the bound local port (useful after an
/// ephemeral `port=0` bind).
pub const CTL_OP_LOCAL_PORT: u32 = 1;

const ACCEPT_RECORD_LEN: usize = 32;
const DEFAULT_BACKLOG: u32 = 128;

struct TcpStream {
    socket: Socket,
    connecting: AtomicBool,
    write_shutdown: AtomicBool,
}

impl TcpStream {
    fn ensure_connected(&self) -> Result<(), CoreError> {
        if !self.connecting.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.socket.take_error() {
            Ok(None) => {
                if self.socket.peer_addr().is_ok() {
                    self.connecting.store(false, Ordering::Release);
                    Ok(())
                } else {
                    Err(CoreError::Again)
                }
            },
            Ok(Some(e)) => Err(map_io_error(&e)),
            Err(e) => Err(map_io_error(&e)),
        }
    }
}

impl HandleOps for TcpStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize, CoreError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.ensure_connected()?;
        (&self.socket).read(buf).map_err(|e| map_io_error(&e))
    }

    fn write(&self, buf: &[u8]) -> Result<usize, CoreError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.write_shutdown.load(Ordering::Acquire) {
            return Err(CoreError::Closed);
        }
        self.ensure_connected()?;
        (&self.socket).write(buf).map_err(|e| map_io_error(&e))
    }

    fn end(&self) -> Result<(), CoreError> {
        let _ = self.socket.shutdown(Shutdown::Both);
        Ok(())
    }

    fn ctl(&self, req: &[u8], _resp: &mut Vec<u8>) -> Result<usize, CoreError> {
        if req.len() < 4 {
            return Err(CoreError::Invalid("ctl op must be 4 bytes".into()));
        }
        let op = (&req[..4]).get_u32_le();
        if op != CTL_OP_SHUT_WR {
            return Err(CoreError::Nosys);
        }
        if self.write_shutdown.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        self.socket.shutdown(Shutdown::Write).map_err(|e| map_io_error(&e))?;
        Ok(0)
    }
}

impl PollOps for TcpStream {
    fn pollable(&self) -> Pollable {
        Pollable::Fd(self.socket.as_raw_fd())
    }
}

struct TcpListener {
    socket: Socket,
    open_flags: u32,
    runtime: Arc<Runtime>,
}

impl TcpListener {
    fn encode_one(&self, conn: Socket, addr: SockAddr) -> [u8; ACCEPT_RECORD_LEN] {
        let _ = conn.set_nonblocking(true);
        apply_stream_opts(&conn, self.open_flags);
        let local_port = conn.local_addr().ok().and_then(|a| a.as_socket()).map_or(0, |s| s.port());

        let stream =
            Arc::new(TcpStream { socket: conn, connecting: AtomicBool::new(false), write_shutdown: AtomicBool::new(false) });
        let handle = self.runtime.handles.alloc_with_poll(
            stream.clone(),
            stream,
            hflags::READABLE | hflags::WRITABLE | hflags::ENDABLE,
        );

        let (peer_addr, peer_port) = ipv6_mapped(addr.as_socket());

        let mut rec = [0_u8; ACCEPT_RECORD_LEN];
        rec[0..4].copy_from_slice(&handle.to_le_bytes());
        rec[4..8].copy_from_slice(&peer_port.to_le_bytes());
        rec[8..24].copy_from_slice(&peer_addr);
        rec[24..28].copy_from_slice(&local_port.to_le_bytes());
        rec
    }
}

fn ipv6_mapped(addr: Option<SocketAddr>) -> ([u8; 16], u32) {
    let mut out = [0_u8; 16];
    let Some(addr) = addr else { return (out, 0) };
    match addr {
        SocketAddr::V4(v4) => {
            out[10] = 0xFF;
            out[11] = 0xFF;
            out[12..16].copy_from_slice(&v4.ip().octets());
            (out, u32::from(v4.port()))
        },
        SocketAddr::V6(v6) => {
            out.copy_from_slice(&v6.ip().octets());
            (out, u32::from(v6.port()))
        },
    }
}

impl HandleOps for TcpListener {
    fn read(&self, buf: &mut [u8]) -> Result<usize, CoreError> {
        if buf.len() < ACCEPT_RECORD_LEN {
            return Err(CoreError::Bounds("accept record needs 32 bytes".into()));
        }
        let max_records = buf.len() / ACCEPT_RECORD_LEN;
        let mut wrote = 0;
        for _ in 0..max_records {
            match self.socket.accept() {
                Ok((conn, addr)) => {
                    let rec = self.encode_one(conn, addr);
                    buf[wrote..wrote + ACCEPT_RECORD_LEN].copy_from_slice(&rec);
                    wrote += ACCEPT_RECORD_LEN;
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    if wrote != 0 {
                        break;
                    }
                    return Err(map_io_error(&e));
                },
            }
        }
        if wrote == 0 {
            return Err(CoreError::Again);
        }
        Ok(wrote)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize, CoreError> {
        Err(CoreError::Nosys)
    }

    fn end(&self) -> Result<(), CoreError> {
        debug!("closing tcp listener");
        Ok(())
    }

    fn ctl(&self, req: &[u8], resp: &mut Vec<u8>) -> Result<usize, CoreError> {
        if req.len() < 4 || (&req[..4]).get_u32_le() != CTL_OP_LOCAL_PORT {
            return Err(CoreError::Nosys);
        }
        let port = self.socket.local_addr().ok().and_then(|a| a.as_socket()).map_or(0, |s| s.port());
        resp.clear();
        resp.extend_from_slice(&u32::from(port).to_le_bytes());
        Ok(4)
    }
}

impl PollOps for TcpListener {
    fn pollable(&self) -> Pollable {
        Pollable::Fd(self.socket.as_raw_fd())
    }
}

fn apply_stream_opts(socket: &Socket, flags: u32) {
    if flags & open_flags::NODELAY != 0 {
        let _ = socket.set_nodelay(true);
    }
    if flags & open_flags::KEEPALIVE != 0 {
        let _ = socket.set_keepalive(true);
    }
}

/// The `(kind="net", name="tcp")` descriptor.
#[must_use]
pub fn descriptor() -> CapDescriptor {
    CapDescriptor {
        kind: "net".into(),
        name: "tcp".into(),
        version: 1,
        flags: cflags::CAN_OPEN | cflags::MAY_BLOCK,
        meta: bytes::Bytes::new(),
    }
}

/// `open` request parameters: `host_len:u32, host_bytes, port:u32, flags:u32,
/// [backlog:u32]`.
fn parse_params(params: &[u8]) -> Result<(String, u16, u32, u32), CoreError> {
    if params.len() < 12 {
        return Err(CoreError::Invalid("tcp open params too short".into()));
    }
    let mut p = params;
    let host_len = p.get_u32_le() as usize;
    if host_len == 0 || host_len > 255 || params.len() < 4 + host_len + 8 {
        return Err(CoreError::Invalid("invalid host length".into()));
    }
    let host_bytes = &p[..host_len];
    if host_bytes.contains(&0) {
        return Err(CoreError::Invalid("host must not contain NUL".into()));
    }
    let host =
        std::str::from_utf8(host_bytes).map_err(|_| CoreError::Invalid("host is not UTF-8".into()))?.to_string();
    let mut rest = &p[host_len..];
    let port = rest.get_u32_le();
    let flags = rest.get_u32_le();
    if port > 65535 {
        return Err(CoreError::Invalid("port out of range".into()));
    }
    if flags & !open_flags::KNOWN != 0 {
        return Err(CoreError::Invalid("unknown tcp open flag".into()));
    }
    let backlog = if rest.len() >= 4 { rest.get_u32_le() } else { DEFAULT_BACKLOG };
    Ok((host, port as u16, flags, backlog))
}

fn allow_env(listen: bool) -> String {
    let key = if listen { "ZI_NET_LISTEN_ALLOW" } else { "ZI_NET_ALLOW" };
    std::env::var(key).unwrap_or_default()
}

/// Open a TCP stream (connect) or listener (bind+listen), per `req.params`.
pub fn open(runtime: &Arc<Runtime>, req: &OpenRequest<'_>) -> Result<u32, CoreError> {
    let (host, port, flags, backlog) = parse_params(req.params)?;
    let host_norm = strip_brackets(&host).to_string();
    let listen = flags & open_flags::LISTEN != 0;

    if listen {
        if !allowlist::allows(&allow_env(true), &host_norm, u32::from(port)) {
            return Err(CoreError::Denied(format!("listen on {host_norm}:{port} not permitted")));
        }
        open_listener(runtime, &host_norm, port, flags, backlog)
    } else {
        if port == 0 {
            return Err(CoreError::Invalid("connect requires a nonzero port".into()));
        }
        if !allowlist::allows(&allow_env(false), &host_norm, u32::from(port)) {
            return Err(CoreError::Denied(format!("connect to {host_norm}:{port} not permitted")));
        }
        open_stream(runtime, &host_norm, port, flags)
    }
}

fn strip_brackets(host: &str) -> &str {
    if host.len() >= 2 && host.starts_with('[') && host.ends_with(']') {
        &host[1..host.len() - 1]
    } else {
        host
    }
}

fn resolve(host: &str, port: u16, wildcard_ok: bool) -> Result<Vec<SocketAddr>, CoreError> {
    if wildcard_ok && host == "*" {
        return Ok(vec![SocketAddr::from(([0, 0, 0, 0], port)), SocketAddr::from(([0; 8], port))]);
    }
    use std::net::ToSocketAddrs;
    (host, port).to_socket_addrs().map(Iterator::collect).map_err(|e| map_io_error(&e))
}

fn open_listener(runtime: &Arc<Runtime>, host: &str, port: u16, flags: u32, backlog: u32) -> Result<u32, CoreError> {
    let addrs = resolve(host, port, true)?;
    let mut last_err = CoreError::Io("no addresses resolved".into());
    for addr in addrs {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
            Ok(s) => s,
            Err(e) => {
                last_err = map_io_error(&e);
                continue;
            },
        };
        let _ = socket.set_nonblocking(true);
        if flags & open_flags::REUSEADDR != 0 {
            let _ = socket.set_reuse_address(true);
        }
        #[cfg(unix)]
        if flags & open_flags::REUSEPORT != 0 {
            let _ = socket.set_reuse_port(true);
        }
        if addr.is_ipv6() && flags & open_flags::IPV6ONLY != 0 {
            let _ = socket.set_only_v6(true);
        }
        if let Err(e) = socket.bind(&addr.into()) {
            last_err = map_io_error(&e);
            continue;
        }
        let backlog = backlog.clamp(1, 65535);
        if let Err(e) = socket.listen(backlog as i32) {
            last_err = map_io_error(&e);
            continue;
        }
        let listener = Arc::new(TcpListener { socket, open_flags: flags, runtime: runtime.clone() });
        let id = runtime.handles.alloc_with_poll(listener.clone(), listener, hflags::READABLE | hflags::ENDABLE);
        return Ok(id);
    }
    Err(last_err)
}

fn open_stream(runtime: &Arc<Runtime>, host: &str, port: u16, flags: u32) -> Result<u32, CoreError> {
    let addrs = resolve(host, port, false)?;
    let mut last_err = CoreError::Io("no addresses resolved".into());
    for addr in addrs {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
            Ok(s) => s,
            Err(e) => {
                last_err = map_io_error(&e);
                continue;
            },
        };
        let _ = socket.set_nonblocking(true);
        apply_stream_opts(&socket, flags);
        let connecting = match socket.connect(&addr.into()) {
            Ok(()) => false,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(e) => {
                last_err = map_io_error(&e);
                continue;
            },
        };
        let stream = Arc::new(TcpStream {
            socket,
            connecting: AtomicBool::new(connecting),
            write_shutdown: AtomicBool::new(false),
        });
        let id = runtime.handles.alloc_with_poll(
            stream.clone(),
            stream,
            hflags::READABLE | hflags::WRITABLE | hflags::ENDABLE,
        );
        return Ok(id);
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(params: &BytesMut) -> OpenRequest<'_> {
        OpenRequest { kind: "net", name: "tcp", version: 1, params }
    }

    #[test]
    fn loopback_listen_then_connect_then_accept() {
        let runtime = Arc::new(Runtime::new_native());
        std::env::set_var("ZI_NET_LISTEN_ALLOW", "any");
        std::env::set_var("ZI_NET_ALLOW", "any");

        let mut listen_params = BytesMut::new();
        listen_params.put_u32_le(9);
        listen_params.put_slice(b"127.0.0.1");
        listen_params.put_u32_le(0); // ephemeral port
        listen_params.put_u32_le(open_flags::REUSEADDR);
        let listener_handle = open(&runtime, &req(&listen_params)).unwrap();

        let bound_port = {
            let listener_ops = runtime.handles.lookup(listener_handle).unwrap();
            let mut port_buf = Vec::new();
            let req_buf = CTL_OP_LOCAL_PORT.to_le_bytes();
            listener_ops.ctl(&req_buf, &mut port_buf).unwrap();
            u16::try_from(u32::from_le_bytes(port_buf[..4].try_into().unwrap())).unwrap()
        };

        let mut connect_params = BytesMut::new();
        connect_params.put_u32_le(9);
        connect_params.put_slice(b"127.0.0.1");
        connect_params.put_u32_le(u32::from(bound_port));
        connect_params.put_u32_le(0);
        let client_handle = open(&runtime, &req(&connect_params)).unwrap();

        // Give the loopback handshake a moment to land in the accept queue.
        std::thread::sleep(std::time::Duration::from_millis(20));

        let listener_ops = runtime.handles.lookup(listener_handle).unwrap();
        let mut accept_buf = vec![0_u8; ACCEPT_RECORD_LEN * 4];
        let n = listener_ops.read(&mut accept_buf).unwrap();
        assert_eq!(n % ACCEPT_RECORD_LEN, 0);
        assert!(n >= ACCEPT_RECORD_LEN);

        let server_conn_handle = u32::from_le_bytes(accept_buf[0..4].try_into().unwrap());
        assert!(server_conn_handle >= zingcore_core::handle::FIRST_ID);

        let client_ops = runtime.handles.lookup(client_handle).unwrap();
        assert_eq!(client_ops.write(b"hi").unwrap(), 2);
    }

    #[test]
    fn parse_params_rejects_short_buffer() {
        assert!(parse_params(&[0; 4]).is_err());
    }

    #[test]
    fn parse_params_rejects_unknown_flags() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(9);
        buf.put_slice(b"localhost");
        buf.put_u32_le(80);
        buf.put_u32_le(0x8000_0000);
        assert!(parse_params(&buf).is_err());
    }

    #[test]
    fn parse_params_accepts_valid_connect_request() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(9);
        buf.put_slice(b"localhost");
        buf.put_u32_le(80);
        buf.put_u32_le(open_flags::NODELAY);
        let (host, port, flags, _backlog) = parse_params(&buf).unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 80);
        assert_eq!(flags, open_flags::NODELAY);
    }
}
