//! `net/http`: a listener/request-framing/streaming-response HTTP capability.
//!
//! The control channel is a single ZCL1 stream (see [`wire::ops`]). A
//! background server thread owns the listener sockets and accepted
//! connections, parses request heads as they complete, and pushes
//! `EV_REQUEST` frames into the control channel's output queue, waking any
//! `sys/loop` watcher via a notify pipe. All shared state (listeners,
//! connections, request slots, the output queue) lives behind one mutex;
//! dispatch never calls back into `with_state` while already holding it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod chunked;
mod error;
mod fetch;
mod limits;
mod multipart;
mod request;
mod wire;

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mio::unix::pipe;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};
use zingcore_core::handle::Pollable;
use zingcore_core::registry::{cflags, CapDescriptor, OpenRequest};
use zingcore_core::{hflags, CoreError, HandleOps, PollOps, Runtime};

use chunked::ChunkedDecoder;
pub use error::HttpError;
pub use limits::Limits;
use multipart::{find_delimiter, MultipartReader, NextPart};
use request::{parse_head, BodyMode};
use wire::{body_kind, ops, WireHeader};

const LISTENER_TOKEN_BASE: usize = 1 << 20;
const FORBIDDEN_RESPONSE_HEADERS: &[&str] = &["content-length", "connection", "transfer-encoding"];

struct Listener {
    socket: Socket,
}

struct Connection {
    socket: Socket,
    buf: BytesMut,
    header_done: bool,
    eof: bool,
    listener_id: u32,
    remote_addr: [u8; 16],
    remote_port: u32,
}

enum RequestBody {
    None,
    Inline(Bytes),
    Stream { len: usize },
    /// `Transfer-Encoding: chunked`, decoded incrementally as raw bytes
    /// arrive. `decoder` tracks the chunk-framing state machine; `pending`
    /// holds decoded body bytes not yet handed to the guest (a single
    /// `feed` can decode more than fits in one `read` call).
    Chunked { decoder: ChunkedDecoder, pending: VecDeque<u8> },
    Multipart { boundary: String, reader: MultipartReader },
}

struct RequestSlot {
    conn_token: usize,
    body: RequestBody,
    /// Absolute offset into the connection's buffer where the body begins.
    body_start: usize,
    /// Absolute offset into the connection's buffer consumed so far
    /// (multipart boundary scanning and chunked decoding both advance this
    /// as they feed raw bytes into their respective state machines).
    cursor: usize,
    /// The in-flight multipart part's shared read cursor, if a part has
    /// been handed to the guest and not yet resolved by `MULTIPART_END`.
    current_part: Option<Arc<AtomicUsize>>,
    responded: bool,
}

struct State {
    next_listener_id: u32,
    next_conn_token: usize,
    next_rid: u32,
    listeners: HashMap<u32, Listener>,
    connections: HashMap<usize, Connection>,
    requests: HashMap<u32, RequestSlot>,
    output: VecDeque<u8>,
    output_has_pending_batch: bool,
}

impl State {
    fn new() -> Self {
        Self {
            next_listener_id: 1,
            next_conn_token: 1,
            next_rid: 1,
            listeners: HashMap::new(),
            connections: HashMap::new(),
            requests: HashMap::new(),
            output: VecDeque::new(),
            output_has_pending_batch: false,
        }
    }

    fn push_frame(&mut self, frame: &[u8]) {
        self.output.extend(frame.iter().copied());
        self.output_has_pending_batch = false;
    }
}

struct Shared {
    runtime: Arc<Runtime>,
    limits: Limits,
    state: Mutex<State>,
    has_listener: Mutex<bool>,
    has_listener_cv: Condvar,
    notify_w: Mutex<pipe::Sender>,
    notify_r: Mutex<pipe::Receiver>,
    shutdown: AtomicBool,
}

impl Shared {
    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    fn wake_loop(&self) {
        let mut w = self.notify_w.lock().unwrap_or_else(|e| e.into_inner());
        let _ = w.write(&[1]);
    }

    fn queue_ok(&self, op: u16, rid: u32, payload: &[u8]) {
        let mut buf = vec![0_u8; 24 + payload.len()];
        let n = zingcore_wire::write_ok(&mut buf, op, rid, payload).unwrap_or(0);
        self.with_state(|s| s.push_frame(&buf[..n]));
        self.wake_loop();
    }

    fn queue_error(&self, op: u16, rid: u32, trace: &str, msg: &str) {
        let mut buf = vec![0_u8; 24 + 12 + trace.len() + msg.len()];
        let n = zingcore_wire::write_error(&mut buf, op, rid, trace.as_bytes(), msg.as_bytes(), b"").unwrap_or(0);
        self.with_state(|s| s.push_frame(&buf[..n]));
        self.wake_loop();
    }
}

/// The HTTP capability's control-channel handle.
pub struct HttpCap {
    shared: Arc<Shared>,
}

impl HttpCap {
    fn dispatch(&self, op: u16, rid: u32, payload: &[u8]) -> Result<BytesMut, HttpError> {
        match op {
            ops::LISTEN => self.op_listen(rid, payload),
            ops::CLOSE_LISTENER => self.op_close_listener(payload),
            ops::FETCH => self.op_fetch(payload),
            ops::RESPOND_START => self.op_respond_start(payload),
            ops::RESPOND_INLINE => self.op_respond_inline(payload),
            ops::RESPOND_STREAM => self.op_respond_stream(payload),
            ops::MULTIPART_BEGIN => self.op_multipart_begin(payload),
            ops::MULTIPART_NEXT => self.op_multipart_next(payload),
            ops::MULTIPART_END => self.op_multipart_end(payload),
            _ => Err(HttpError::Core(CoreError::Nosys)),
        }
    }

    fn op_listen(&self, _rid: u32, mut payload: &[u8]) -> Result<BytesMut, HttpError> {
        if payload.len() < 12 {
            return Err(HttpError::MalformedRequest("LISTEN payload too short".into()));
        }
        let port = payload.get_u32_le();
        let _flags = payload.get_u32_le();
        let host_len = payload.get_u32_le() as usize;
        if payload.len() < host_len {
            return Err(HttpError::MalformedRequest("LISTEN host truncated".into()));
        }
        let host = std::str::from_utf8(&payload[..host_len])
            .map_err(|_| HttpError::MalformedRequest("LISTEN host not UTF-8".into()))?
            .to_string();

        let allow = std::env::var("ZI_NET_LISTEN_ALLOW").unwrap_or_default();
        if !zingcore_net::allowlist::allows(&allow, &host, u32::from(port)) {
            return Err(HttpError::Denied(format!("listen on {host}:{port} not permitted")));
        }

        let already = self.shared.with_state(|s| s.listeners.len());
        if already >= self.shared.limits.max_listeners {
            return Err(HttpError::MultipartLimit("too many listeners".into()));
        }

        let addr: std::net::SocketAddr = (host.as_str(), port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut it| it.next())
            .ok_or_else(|| HttpError::MalformedRequest("could not resolve bind address".into()))?;
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| HttpError::Core(zingcore_net::map_io_error(&e)))?;
        socket.set_reuse_address(true).ok();
        socket.set_nonblocking(true).ok();
        socket.bind(&addr.into()).map_err(|e| HttpError::Core(zingcore_net::map_io_error(&e)))?;
        socket.listen(128).map_err(|e| HttpError::Core(zingcore_net::map_io_error(&e)))?;

        let bound = socket.local_addr().ok().and_then(|a| a.as_socket());
        let (bound_addr, bound_port) = ipv6_mapped(bound);

        let id = self.shared.with_state(|s| {
            let id = s.next_listener_id;
            s.next_listener_id += 1;
            s.listeners.insert(id, Listener { socket });
            id
        });

        {
            let mut has = self.shared.has_listener.lock().unwrap_or_else(|e| e.into_inner());
            *has = true;
            self.shared.has_listener_cv.notify_all();
        }
        self.shared.wake_loop();

        let mut resp = BytesMut::with_capacity(24);
        resp.put_u32_le(id);
        resp.put_u32_le(bound_port);
        resp.put_slice(&bound_addr);
        Ok(resp)
    }

    fn op_close_listener(&self, mut payload: &[u8]) -> Result<BytesMut, HttpError> {
        if payload.len() < 4 {
            return Err(HttpError::MalformedRequest("CLOSE_LISTENER payload too short".into()));
        }
        let id = payload.get_u32_le();
        let removed = self.shared.with_state(|s| s.listeners.remove(&id).is_some());
        if !removed {
            return Err(HttpError::NoSuchId);
        }
        Ok(BytesMut::new())
    }

    fn op_fetch(&self, mut payload: &[u8]) -> Result<BytesMut, HttpError> {
        let method = read_len_prefixed_str(&mut payload)?;
        let url = read_len_prefixed_str(&mut payload)?;
        let headers = wire::parse_headers(&mut payload).ok_or_else(|| HttpError::MalformedRequest("bad FETCH headers".into()))?;
        if payload.len() < 4 {
            return Err(HttpError::MalformedRequest("FETCH missing body_kind".into()));
        }
        let kind = payload.get_u32_le();
        let body = match kind {
            body_kind::NONE => None,
            body_kind::INLINE => {
                if payload.len() < 4 {
                    return Err(HttpError::MalformedRequest("FETCH missing inline body".into()));
                }
                let len = payload.get_u32_le() as usize;
                if payload.len() < len {
                    return Err(HttpError::MalformedRequest("FETCH inline body truncated".into()));
                }
                Some(payload[..len].to_vec())
            },
            body_kind::STREAM => {
                if payload.len() < 4 {
                    return Err(HttpError::MalformedRequest("FETCH missing body handle".into()));
                }
                let handle = payload.get_u32_le();
                let ops = self.shared.runtime.handles.lookup(handle)?;
                let mut buf = Vec::new();
                let mut chunk = [0_u8; 4096];
                loop {
                    match ops.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        Err(CoreError::Again) => continue,
                        Err(e) => return Err(HttpError::Core(e)),
                    }
                }
                Some(buf)
            },
            _ => return Err(HttpError::MalformedRequest("unknown FETCH body_kind".into())),
        };

        let response = fetch::fetch(&method, &url, &headers, body.as_deref(), &self.shared.limits)?;

        let mut resp = BytesMut::new();
        resp.put_u32_le(u32::from(response.status));
        resp.put_u32_le(response.headers.len() as u32);
        for (name, value) in &response.headers {
            put_str(&mut resp, name);
            put_str(&mut resp, value);
        }
        resp.put_u32_le(body_kind::INLINE);
        resp.put_u32_le(response.body.len() as u32);
        resp.put_slice(&response.body);
        Ok(resp)
    }

    fn op_respond_start(&self, mut payload: &[u8]) -> Result<BytesMut, HttpError> {
        if payload.len() < 4 {
            return Err(HttpError::MalformedRequest("RESPOND_START payload too short".into()));
        }
        let rid = payload.get_u32_le();
        let _flags = if payload.len() >= 4 { payload.get_u32_le() } else { 0 };
        let _headers = wire::parse_headers(&mut payload);
        self.shared.with_state(|s| {
            s.requests.get(&rid).map(|_| ()).ok_or(HttpError::NoSuchId)
        })?;
        Ok(BytesMut::new())
    }

    fn op_respond_inline(&self, mut payload: &[u8]) -> Result<BytesMut, HttpError> {
        if payload.len() < 8 {
            return Err(HttpError::MalformedRequest("RESPOND_INLINE payload too short".into()));
        }
        let rid = payload.get_u32_le();
        let status = payload.get_u32_le();
        let headers = wire::parse_headers(&mut payload).ok_or_else(|| HttpError::MalformedRequest("bad headers".into()))?;
        if payload.len() < 4 {
            return Err(HttpError::MalformedRequest("RESPOND_INLINE missing body".into()));
        }
        let body_len = payload.get_u32_le() as usize;
        if payload.len() < body_len {
            return Err(HttpError::MalformedRequest("RESPOND_INLINE body truncated".into()));
        }
        let body = &payload[..body_len];

        let conn_token = self.shared.with_state(|s| {
            let slot = s.requests.get(&rid).ok_or(HttpError::NoSuchId)?;
            if slot.responded {
                return Err(HttpError::MalformedRequest("request already responded to".into()));
            }
            Ok(slot.conn_token)
        })?;

        let mut bytes = format_status_line(status);
        for (name, value) in &headers {
            if FORBIDDEN_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            bytes.extend_from_slice(name.as_bytes());
            bytes.extend_from_slice(b": ");
            bytes.extend_from_slice(value.as_bytes());
            bytes.extend_from_slice(b"\r\n");
        }
        bytes.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        bytes.extend_from_slice(b"Connection: close\r\n\r\n");
        bytes.extend_from_slice(body);

        self.shared.with_state(|s| -> Result<(), HttpError> {
            let conn = s.connections.get(&conn_token).ok_or(HttpError::NoSuchId)?;
            send_all(&conn.socket, &bytes)?;
            let _ = conn.socket.shutdown(std::net::Shutdown::Both);
            s.connections.remove(&conn_token);
            if let Some(slot) = s.requests.get_mut(&rid) {
                slot.responded = true;
            }
            Ok(())
        })?;

        Ok(BytesMut::new())
    }

    fn op_respond_stream(&self, mut payload: &[u8]) -> Result<BytesMut, HttpError> {
        if payload.len() < 8 {
            return Err(HttpError::MalformedRequest("RESPOND_STREAM payload too short".into()));
        }
        let rid = payload.get_u32_le();
        let status = payload.get_u32_le();
        let headers = wire::parse_headers(&mut payload).ok_or_else(|| HttpError::MalformedRequest("bad headers".into()))?;
        for (name, _) in &headers {
            if FORBIDDEN_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                return Err(HttpError::ForbiddenHeader(name.clone()));
            }
        }

        let (conn_socket, conn_token) = self.shared.with_state(|s| -> Result<(Socket, usize), HttpError> {
            let slot = s.requests.get(&rid).ok_or(HttpError::NoSuchId)?;
            if slot.responded {
                return Err(HttpError::MalformedRequest("request already responded to".into()));
            }
            let conn = s.connections.get(&slot.conn_token).ok_or(HttpError::NoSuchId)?;
            let cloned = conn.socket.try_clone().map_err(|e| HttpError::Core(zingcore_net::map_io_error(&e)))?;
            Ok((cloned, slot.conn_token))
        })?;

        let mut bytes = format_status_line(status);
        for (name, value) in &headers {
            bytes.extend_from_slice(name.as_bytes());
            bytes.extend_from_slice(b": ");
            bytes.extend_from_slice(value.as_bytes());
            bytes.extend_from_slice(b"\r\n");
        }
        bytes.extend_from_slice(b"Connection: close\r\n\r\n");
        send_all(&conn_socket, &bytes)?;

        conn_socket.set_nonblocking(true).ok();
        let body_stream = Arc::new(ResponseBody {
            socket: conn_socket,
            shared: self.shared.clone(),
            rid,
            conn_token,
            ended: AtomicBool::new(false),
        });
        let handle = self.shared.runtime.handles.alloc(body_stream, hflags::WRITABLE | hflags::ENDABLE);

        self.shared.with_state(|s| {
            if let Some(slot) = s.requests.get_mut(&rid) {
                slot.responded = true;
            }
        });

        let mut resp = BytesMut::with_capacity(4);
        resp.put_u32_le(handle);
        Ok(resp)
    }

    fn op_multipart_begin(&self, mut payload: &[u8]) -> Result<BytesMut, HttpError> {
        let rid = read_u32(&mut payload)?;
        self.shared.with_state(|s| {
            let slot = s.requests.get_mut(&rid).ok_or(HttpError::NoSuchId)?;
            match &slot.body {
                RequestBody::Multipart { .. } => Ok(()),
                _ => Err(HttpError::MalformedRequest("request body is not multipart".into())),
            }
        })?;
        Ok(BytesMut::new())
    }

    fn op_multipart_next(&self, mut payload: &[u8]) -> Result<BytesMut, HttpError> {
        let rid = read_u32(&mut payload)?;
        let conn_token = self.shared.with_state(|s| s.requests.get(&rid).map(|r| r.conn_token)).ok_or(HttpError::NoSuchId)?;

        loop {
            let outcome = self.shared.with_state(|s| -> Result<NextPart, HttpError> {
                let cursor = s.requests.get(&rid).ok_or(HttpError::NoSuchId)?.cursor;
                let available: Vec<u8> = match s.connections.get(&conn_token) {
                    Some(conn) if conn.buf.len() > cursor => conn.buf[cursor..].to_vec(),
                    _ => Vec::new(),
                };
                let slot = s.requests.get_mut(&rid).ok_or(HttpError::NoSuchId)?;
                let RequestBody::Multipart { reader, .. } = &mut slot.body else {
                    return Err(HttpError::MalformedRequest("request body is not multipart".into()));
                };
                reader.next_part(&available)
            })?;

            match outcome {
                NextPart::Done => {
                    let mut resp = BytesMut::with_capacity(4);
                    resp.put_u32_le(1);
                    return Ok(resp);
                },
                NextPart::Part { headers, body_start } => {
                    let consumed = self.shared.with_state(|s| -> Result<Arc<AtomicUsize>, HttpError> {
                        let slot = s.requests.get_mut(&rid).ok_or(HttpError::NoSuchId)?;
                        let counter = Arc::new(AtomicUsize::new(slot.cursor + body_start));
                        slot.current_part = Some(counter.clone());
                        Ok(counter)
                    })?;
                    let part = Arc::new(PartBody { shared: self.shared.clone(), conn_token, rid, consumed });
                    let handle = self.shared.runtime.handles.alloc(part, hflags::READABLE | hflags::ENDABLE);

                    let mut resp = BytesMut::new();
                    resp.put_u32_le(0); // done = false
                    put_str(&mut resp, &headers.name);
                    match &headers.filename {
                        Some(f) => {
                            resp.put_u32_le(1);
                            put_str(&mut resp, f);
                        },
                        None => resp.put_u32_le(0),
                    }
                    match &headers.content_type {
                        Some(ct) => {
                            resp.put_u32_le(1);
                            put_str(&mut resp, ct);
                        },
                        None => resp.put_u32_le(0),
                    }
                    resp.put_u32_le(headers.headers.len() as u32);
                    for (name, value) in &headers.headers {
                        put_str(&mut resp, name);
                        put_str(&mut resp, value);
                    }
                    resp.put_u32_le(handle);
                    return Ok(resp);
                },
                NextPart::NeedMoreData => {
                    if !self.pump_connection_once(conn_token) {
                        return Err(HttpError::MalformedRequest("connection closed mid-multipart".into()));
                    }
                },
            }
        }
    }

    fn op_multipart_end(&self, mut payload: &[u8]) -> Result<BytesMut, HttpError> {
        let rid = read_u32(&mut payload)?;
        let conn_token = self.shared.with_state(|s| s.requests.get(&rid).map(|r| r.conn_token)).ok_or(HttpError::NoSuchId)?;
        loop {
            match try_finish_part(&self.shared, rid, conn_token) {
                Some(true) => return Ok(BytesMut::new()),
                Some(false) => {
                    if !self.pump_connection_once(conn_token) {
                        return Err(HttpError::MalformedRequest("connection closed mid-multipart".into()));
                    }
                },
                None => return Err(HttpError::MalformedRequest("request body is not multipart".into())),
            }
        }
    }

    /// Pull more bytes off `conn_token`'s socket into its buffer. Returns
    /// `false` on EOF/error.
    fn pump_connection_once(&self, conn_token: usize) -> bool {
        self.shared.with_state(|s| {
            let Some(conn) = s.connections.get_mut(&conn_token) else { return false };
            let mut chunk = [0_u8; 4096];
            match (&conn.socket).read(&mut chunk) {
                Ok(0) => false,
                Ok(n) => {
                    conn.buf.extend_from_slice(&chunk[..n]);
                    true
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                    true
                },
                Err(_) => false,
            }
        })
    }
}

/// Resolve the in-flight multipart part, if any, advancing the request's
/// boundary-scan cursor past it. Returns `Some(true)` once resolved (or
/// when there was no part to resolve), `Some(false)` when the delimiter
/// hasn't fully arrived yet, `None` if `rid`'s body isn't multipart.
fn try_finish_part(shared: &Arc<Shared>, rid: u32, conn_token: usize) -> Option<bool> {
    shared.with_state(|s| {
        if !matches!(s.requests.get(&rid).map(|r| &r.body), Some(RequestBody::Multipart { .. })) {
            return None;
        }
        let Some(counter) = s.requests.get(&rid).and_then(|r| r.current_part.clone()) else {
            if let Some(slot) = s.requests.get_mut(&rid) {
                if let RequestBody::Multipart { reader, .. } = &mut slot.body {
                    reader.mark_need_boundary();
                }
            }
            return Some(true);
        };
        let start = counter.load(Ordering::Acquire);
        let Some(conn) = s.connections.get(&conn_token) else { return Some(true) };
        let available: &[u8] = if conn.buf.len() > start { &conn.buf[start..] } else { &[] };
        let boundary = match s.requests.get(&rid).map(|r| &r.body) {
            Some(RequestBody::Multipart { boundary, .. }) => boundary.clone(),
            _ => return None,
        };
        match find_delimiter(available, &boundary) {
            Some(off) => {
                let new_cursor = start + off;
                if let Some(slot) = s.requests.get_mut(&rid) {
                    slot.cursor = new_cursor;
                    slot.current_part = None;
                    if let RequestBody::Multipart { reader, .. } = &mut slot.body {
                        reader.mark_need_boundary();
                    }
                }
                Some(true)
            },
            None => Some(false),
        }
    })
}

impl HandleOps for HttpCap {
    fn read(&self, buf: &mut [u8]) -> Result<usize, CoreError> {
        self.shared.with_state(|s| {
            if s.output.is_empty() {
                return Err(CoreError::Again);
            }
            let n = buf.len().min(s.output.len());
            for slot in buf.iter_mut().take(n) {
                *slot = s.output.pop_front().unwrap_or(0);
            }
            Ok(n)
        })
    }

    fn write(&self, buf: &[u8]) -> Result<usize, CoreError> {
        let busy = self.shared.with_state(|s| s.output_has_pending_batch && !s.output.is_empty());
        if busy {
            return Err(CoreError::Again);
        }
        let frame = zingcore_wire::parse(buf).map_err(|e| CoreError::Invalid(e.to_string()))?;
        let op = frame.header.op();
        let rid = frame.header.rid();
        match self.dispatch(op, rid, frame.payload) {
            Ok(resp) => self.shared.queue_ok(op, rid, &resp),
            Err(e) => self.shared.queue_error(op, rid, e.trace(), &e.to_string()),
        }
        Ok(buf.len())
    }

    fn end(&self) -> Result<(), CoreError> {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_loop();
        Ok(())
    }
}

impl PollOps for HttpCap {
    fn pollable(&self) -> Pollable {
        let wakeup_fd = {
            let r = self.shared.notify_r.lock().unwrap_or_else(|e| e.into_inner());
            r.as_raw_fd()
        };
        Pollable::Computed { wakeup_fd }
    }

    fn get_ready(&self) -> u32 {
        let ready = self.shared.with_state(|s| !s.output.is_empty());
        if ready { zingcore_wire::event::READABLE } else { 0 }
    }

    fn drain_wakeup(&self) {
        let mut r = self.shared.notify_r.lock().unwrap_or_else(|e| e.into_inner());
        let mut scratch = [0_u8; 64];
        while matches!((&mut *r).read(&mut scratch), Ok(n) if n > 0) {}
    }
}

struct ResponseBody {
    socket: Socket,
    shared: Arc<Shared>,
    rid: u32,
    conn_token: usize,
    ended: AtomicBool,
}

impl HandleOps for ResponseBody {
    fn read(&self, _buf: &mut [u8]) -> Result<usize, CoreError> {
        Err(CoreError::Nosys)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, CoreError> {
        (&self.socket).write(buf).or_else(|e| if e.kind() == std::io::ErrorKind::WouldBlock { Ok(0) } else { Err(e) }).map_err(|e| zingcore_net::map_io_error(&e))
    }

    fn end(&self) -> Result<(), CoreError> {
        if self.ended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        self.shared.with_state(|s| {
            s.connections.remove(&self.conn_token);
            s.requests.remove(&self.rid);
        });
        Ok(())
    }
}

struct PartBody {
    shared: Arc<Shared>,
    conn_token: usize,
    rid: u32,
    consumed: Arc<AtomicUsize>,
}

impl HandleOps for PartBody {
    fn read(&self, buf: &mut [u8]) -> Result<usize, CoreError> {
        self.shared.with_state(|s| {
            let boundary = match s.requests.get(&self.rid).map(|r| &r.body) {
                Some(RequestBody::Multipart { boundary, .. }) => boundary.clone(),
                Some(_) => return Err(CoreError::Invalid("request body is not multipart".into())),
                None => return Err(CoreError::Noent("no such request".into())),
            };
            let conn = s.connections.get(&self.conn_token).ok_or_else(|| CoreError::Noent("no such connection".into()))?;
            let start = self.consumed.load(Ordering::Acquire).min(conn.buf.len());
            let available = &conn.buf[start..];

            match find_delimiter(available, &boundary) {
                Some(off) => {
                    if off == 0 {
                        return Ok(0);
                    }
                    let take = off.min(buf.len());
                    buf[..take].copy_from_slice(&available[..take]);
                    self.consumed.fetch_add(take, Ordering::AcqRel);
                    Ok(take)
                },
                None => {
                    // Hold back delim_len - 1 bytes so a split delimiter is
                    // never emitted to the guest.
                    let holdback = boundary.len() + 3;
                    let safe_len = available.len().saturating_sub(holdback);
                    if safe_len == 0 {
                        return Err(CoreError::Again);
                    }
                    let take = safe_len.min(buf.len());
                    buf[..take].copy_from_slice(&available[..take]);
                    self.consumed.fetch_add(take, Ordering::AcqRel);
                    Ok(take)
                },
            }
        })
    }

    fn write(&self, _buf: &[u8]) -> Result<usize, CoreError> {
        Err(CoreError::Nosys)
    }

    fn end(&self) -> Result<(), CoreError> {
        let _ = try_finish_part(&self.shared, self.rid, self.conn_token);
        Ok(())
    }
}

struct RequestBodyStream {
    shared: Arc<Shared>,
    conn_token: usize,
    rid: u32,
    consumed: AtomicUsize,
}

impl HandleOps for RequestBodyStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize, CoreError> {
        self.shared.with_state(|s| {
            let slot = s.requests.get(&self.rid).ok_or_else(|| CoreError::Noent("no such request".into()))?;
            let RequestBody::Stream { len } = &slot.body else {
                return Err(CoreError::Invalid("request body is not a stream".into()));
            };
            let end = slot.body_start + len;
            let start = self.consumed.load(Ordering::Acquire).max(slot.body_start);
            if start >= end {
                return Ok(0);
            }
            let conn = s.connections.get(&self.conn_token).ok_or_else(|| CoreError::Noent("no such connection".into()))?;
            if conn.buf.len() <= start {
                return Err(CoreError::Again);
            }
            let avail_end = conn.buf.len().min(end);
            let take = (avail_end - start).min(buf.len());
            buf[..take].copy_from_slice(&conn.buf[start..start + take]);
            self.consumed.fetch_add(take, Ordering::AcqRel);
            Ok(take)
        })
    }

    fn write(&self, _buf: &[u8]) -> Result<usize, CoreError> {
        Err(CoreError::Nosys)
    }

    fn end(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// A streamed chunked-transfer-encoding request body. Decoding state lives
/// on the [`RequestSlot`] (behind the shared mutex) rather than on this
/// handle, since advancing the decoder and advancing `cursor` into the
/// connection buffer must happen atomically together.
struct ChunkedBodyStream {
    shared: Arc<Shared>,
    conn_token: usize,
    rid: u32,
}

impl HandleOps for ChunkedBodyStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize, CoreError> {
        self.shared.with_state(|s| {
            // Drain whatever's already decoded before asking for more raw
            // bytes; a prior feed() may have produced more than one read()
            // can carry.
            let drained = {
                let slot = s.requests.get_mut(&self.rid).ok_or_else(|| CoreError::Noent("no such request".into()))?;
                let RequestBody::Chunked { pending, .. } = &mut slot.body else {
                    return Err(CoreError::Invalid("request body is not chunked".into()));
                };
                if pending.is_empty() {
                    None
                } else {
                    let take = pending.len().min(buf.len());
                    for slot_byte in buf.iter_mut().take(take) {
                        *slot_byte = pending.pop_front().unwrap_or(0);
                    }
                    Some(take)
                }
            };
            if let Some(take) = drained {
                return Ok(take);
            }

            let raw_cursor = s.requests.get(&self.rid).ok_or_else(|| CoreError::Noent("no such request".into()))?.cursor;
            let conn = s.connections.get(&self.conn_token).ok_or_else(|| CoreError::Noent("no such connection".into()))?;
            if conn.buf.len() <= raw_cursor {
                if conn.eof {
                    return Err(CoreError::Io("connection closed mid-chunk".into()));
                }
                return Err(CoreError::Again);
            }
            let available = conn.buf[raw_cursor..].to_vec();

            let (consumed, done) = {
                let slot = s.requests.get_mut(&self.rid).ok_or_else(|| CoreError::Noent("no such request".into()))?;
                let RequestBody::Chunked { decoder, pending } = &mut slot.body else {
                    return Err(CoreError::Invalid("request body is not chunked".into()));
                };
                let outcome = decoder.feed(&available).map_err(|e| CoreError::Invalid(e.to_string()))?;
                pending.extend(outcome.body);
                (outcome.consumed, decoder.is_done())
            };
            if let Some(slot) = s.requests.get_mut(&self.rid) {
                slot.cursor += consumed;
            }

            let slot = s.requests.get_mut(&self.rid).ok_or_else(|| CoreError::Noent("no such request".into()))?;
            let RequestBody::Chunked { pending, .. } = &mut slot.body else {
                return Err(CoreError::Invalid("request body is not chunked".into()));
            };
            if pending.is_empty() {
                return if done { Ok(0) } else { Err(CoreError::Again) };
            }
            let take = pending.len().min(buf.len());
            for slot_byte in buf.iter_mut().take(take) {
                *slot_byte = pending.pop_front().unwrap_or(0);
            }
            Ok(take)
        })
    }

    fn write(&self, _buf: &[u8]) -> Result<usize, CoreError> {
        Err(CoreError::Nosys)
    }

    fn end(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

fn format_status_line(status: u32) -> Vec<u8> {
    format!("HTTP/1.1 {status} {}\r\n", reason_phrase(status)).into_bytes()
}

fn reason_phrase(status: u32) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn send_all(socket: &Socket, mut bytes: &[u8]) -> Result<(), HttpError> {
    while !bytes.is_empty() {
        match (socket).write(bytes) {
            Ok(0) => return Err(HttpError::Core(CoreError::Closed)),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            },
            Err(e) => return Err(HttpError::Core(zingcore_net::map_io_error(&e))),
        }
    }
    Ok(())
}

fn ipv6_mapped(addr: Option<std::net::SocketAddr>) -> ([u8; 16], u32) {
    let mut out = [0_u8; 16];
    let Some(addr) = addr else { return (out, 0) };
    match addr {
        std::net::SocketAddr::V4(v4) => {
            out[10] = 0xFF;
            out[11] = 0xFF;
            out[12..16].copy_from_slice(&v4.ip().octets());
            (out, u32::from(v4.port()))
        },
        std::net::SocketAddr::V6(v6) => {
            out.copy_from_slice(&v6.ip().octets());
            (out, u32::from(v6.port()))
        },
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn read_len_prefixed_str(buf: &mut &[u8]) -> Result<String, HttpError> {
    if buf.len() < 4 {
        return Err(HttpError::MalformedRequest("truncated length-prefixed field".into()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.len() < len {
        return Err(HttpError::MalformedRequest("truncated length-prefixed field".into()));
    }
    let s = std::str::from_utf8(&buf[..len]).map_err(|_| HttpError::MalformedRequest("field not UTF-8".into()))?.to_string();
    buf.advance(len);
    Ok(s)
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, HttpError> {
    if buf.len() < 4 {
        return Err(HttpError::MalformedRequest("truncated u32 field".into()));
    }
    Ok(buf.get_u32_le())
}

use std::net::ToSocketAddrs;

/// Run the server thread: accept connections on all live listeners, read
/// request heads, and queue `EV_REQUEST` frames.
fn server_thread(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        {
            let mut has = shared.has_listener.lock().unwrap_or_else(|e| e.into_inner());
            while !*has && !shared.shutdown.load(Ordering::Acquire) {
                let (guard, timeout) = shared.has_listener_cv.wait_timeout(has, Duration::from_millis(250)).unwrap_or_else(|e| e.into_inner());
                has = guard;
                if timeout.timed_out() {
                    break;
                }
            }
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        let mut poll = match Poll::new() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "http server thread: failed to build poller");
                return;
            },
        };
        let mut events = Events::with_capacity(256);

        let (listener_ids, conn_tokens) = shared.with_state(|s| {
            (s.listeners.keys().copied().collect::<Vec<_>>(), s.connections.keys().copied().collect::<Vec<_>>())
        });

        shared.with_state(|s| {
            for id in &listener_ids {
                if let Some(l) = s.listeners.get(id) {
                    let mut fd = SourceFd(&l.socket.as_raw_fd());
                    let _ = poll.registry().register(&mut fd, Token(LISTENER_TOKEN_BASE + *id as usize), Interest::READABLE);
                }
            }
            for token in &conn_tokens {
                if let Some(c) = s.connections.get(token) {
                    // Keep polling past header_done: streamed and multipart
                    // bodies still need bytes pumped into conn.buf.
                    let mut fd = SourceFd(&c.socket.as_raw_fd());
                    let _ = poll.registry().register(&mut fd, Token(*token), Interest::READABLE);
                }
            }
        });

        if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(250))) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                debug!(error = %e, "http server thread: poll error");
            }
            continue;
        }

        for event in &events {
            let token = event.token().0;
            if token >= LISTENER_TOKEN_BASE {
                let listener_id = (token - LISTENER_TOKEN_BASE) as u32;
                accept_all(&shared, listener_id);
            } else {
                pump_and_maybe_parse(&shared, token);
            }
        }
    }
}

fn accept_all(shared: &Arc<Shared>, listener_id: u32) {
    loop {
        let accepted = shared.with_state(|s| {
            let listener = s.listeners.get(&listener_id)?;
            match listener.socket.accept() {
                Ok((socket, addr)) => Some((socket, addr)),
                Err(_) => None,
            }
        });
        let Some((socket, addr)) = accepted else { break };
        let _ = socket.set_nonblocking(true);
        let (remote_addr, remote_port) = ipv6_mapped(addr.as_socket());

        shared.with_state(|s| {
            let token = s.next_conn_token;
            s.next_conn_token += 1;
            s.connections.insert(
                token,
                Connection { socket, buf: BytesMut::new(), header_done: false, eof: false, listener_id, remote_addr, remote_port },
            );
            debug!(listener_id, token, remote_port, "accepted http connection");
        });
    }
}

enum PumpOutcome {
    Progressed,
    AtEof,
    HardError,
}

fn pump_and_maybe_parse(shared: &Arc<Shared>, token: usize) {
    let outcome = shared.with_state(|s| {
        let Some(conn) = s.connections.get_mut(&token) else { return PumpOutcome::HardError };
        if conn.eof {
            return PumpOutcome::AtEof;
        }
        let mut chunk = [0_u8; 4096];
        match (&conn.socket).read(&mut chunk) {
            Ok(0) => {
                conn.eof = true;
                PumpOutcome::AtEof
            },
            Ok(n) => {
                conn.buf.extend_from_slice(&chunk[..n]);
                PumpOutcome::Progressed
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => PumpOutcome::Progressed,
            Err(_) => PumpOutcome::HardError,
        }
    });

    match outcome {
        PumpOutcome::HardError => {
            shared.with_state(|s| s.connections.remove(&token));
            return;
        },
        PumpOutcome::AtEof => {
            // A client that closed before the request head completed is
            // genuinely dead; one with a parsed head may still have a
            // fully-buffered body worth keeping for in-flight reads.
            let has_head = shared.with_state(|s| s.connections.get(&token).is_some_and(|c| c.header_done));
            if !has_head {
                shared.with_state(|s| s.connections.remove(&token));
                return;
            }
        },
        PumpOutcome::Progressed => {},
    }

    try_parse_head(shared, token);
}

fn try_parse_head(shared: &Arc<Shared>, token: usize) {
    let parsed = shared.with_state(|s| -> Option<(u32, BytesMut)> {
        let conn = s.connections.get(&token)?;
        if conn.header_done {
            return None;
        }
        let listener_id = conn.listener_id;
        let remote_addr = conn.remote_addr;
        let remote_port = conn.remote_port;

        match parse_head(&conn.buf, &shared.limits) {
            Ok((req, body_start)) => {
                let remainder = BytesMut::from(&conn.buf[body_start..]);

                let method = req.method.clone();
                let path = req.path.clone();
                let host = req.header("host").unwrap_or("").to_string();
                let headers: Vec<WireHeader> = req.headers.clone();

                let rid = s.next_rid;
                s.next_rid += 1;

                let body = match req.body_mode {
                    BodyMode::None => RequestBody::None,
                    BodyMode::Inline { len } => {
                        if remainder.len() >= len {
                            RequestBody::Inline(Bytes::copy_from_slice(&remainder[..len]))
                        } else {
                            RequestBody::Stream { len }
                        }
                    },
                    BodyMode::Stream { len } => RequestBody::Stream { len },
                    BodyMode::Chunked => {
                        RequestBody::Chunked { decoder: ChunkedDecoder::new(shared.limits.max_header_bytes), pending: VecDeque::new() }
                    },
                    BodyMode::Multipart { boundary } => {
                        RequestBody::Multipart { reader: MultipartReader::new(&boundary, shared.limits), boundary }
                    },
                };

                let body_kind_val = match &body {
                    RequestBody::None => body_kind::NONE,
                    RequestBody::Inline(_) => body_kind::INLINE,
                    RequestBody::Stream { .. } | RequestBody::Chunked { .. } => body_kind::STREAM,
                    RequestBody::Multipart { .. } => body_kind::MULTIPART,
                };
                let inline_bytes = if let RequestBody::Inline(b) = &body { Some(b.clone()) } else { None };
                let needs_handle = matches!(body, RequestBody::Stream { .. } | RequestBody::Chunked { .. });
                let is_chunked = matches!(body, RequestBody::Chunked { .. });

                if let Some(conn) = s.connections.get_mut(&token) {
                    conn.header_done = true;
                }
                s.requests.insert(rid, RequestSlot { conn_token: token, body, body_start, cursor: body_start, current_part: None, responded: false });

                let stream_handle = needs_handle.then(|| {
                    if is_chunked {
                        let stream = Arc::new(ChunkedBodyStream { shared: shared.clone(), conn_token: token, rid });
                        shared.runtime.handles.alloc(stream, hflags::READABLE | hflags::ENDABLE)
                    } else {
                        let stream = Arc::new(RequestBodyStream {
                            shared: shared.clone(),
                            conn_token: token,
                            rid,
                            consumed: AtomicUsize::new(body_start),
                        });
                        shared.runtime.handles.alloc(stream, hflags::READABLE | hflags::ENDABLE)
                    }
                });

                let frame = wire::encode_ev_request(
                    listener_id,
                    &method,
                    &path,
                    "http",
                    &host,
                    remote_addr,
                    remote_port,
                    &headers,
                    body_kind_val,
                    inline_bytes.as_deref(),
                    stream_handle,
                );
                let mut out = vec![0_u8; 24 + frame.len()];
                let n = zingcore_wire::write_ok(&mut out, ops::EV_REQUEST, rid, &frame).unwrap_or(0);
                Some((rid, BytesMut::from(&out[..n])))
            },
            Err(_) => None,
        }
    });

    if let Some((_rid, frame)) = parsed {
        shared.with_state(|s| s.push_frame(&frame));
        shared.wake_loop();
    }
}

/// The `(kind="net", name="http")` descriptor.
#[must_use]
pub fn descriptor() -> CapDescriptor {
    CapDescriptor {
        kind: "net".into(),
        name: "http".into(),
        version: 1,
        flags: cflags::CAN_OPEN | cflags::MAY_BLOCK,
        meta: bytes::Bytes::new(),
    }
}

/// Open an HTTP capability handle, starting its background server thread.
pub fn open(runtime: &Arc<Runtime>, _req: &OpenRequest<'_>) -> Result<u32, CoreError> {
    let (sender, receiver) = pipe::new().map_err(|e| CoreError::Io(e.to_string()))?;
    sender.set_nonblocking(true).ok();
    receiver.set_nonblocking(true).ok();

    let shared = Arc::new(Shared {
        runtime: runtime.clone(),
        limits: Limits::from_env(),
        state: Mutex::new(State::new()),
        has_listener: Mutex::new(false),
        has_listener_cv: Condvar::new(),
        notify_w: Mutex::new(sender),
        notify_r: Mutex::new(receiver),
        shutdown: AtomicBool::new(false),
    });

    {
        let shared = shared.clone();
        std::thread::Builder::new()
            .name("zingcore-http-server".into())
            .spawn(move || server_thread(shared))
            .map_err(|e| CoreError::Io(e.to_string()))?;
    }

    let cap = Arc::new(HttpCap { shared: shared.clone() });
    let id = runtime.handles.alloc_with_poll(cap.clone(), cap, hflags::READABLE | hflags::WRITABLE | hflags::ENDABLE);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_str(buf: &mut &[u8]) -> Option<String> {
        let len = buf.get_u32_le() as usize;
        let s = std::str::from_utf8(&buf[..len]).ok()?.to_string();
        buf.advance(len);
        Some(s)
    }

    #[test]
    fn descriptor_advertises_net_http() {
        let d = descriptor();
        assert_eq!(d.kind, "net");
        assert_eq!(d.name, "http");
    }

    #[test]
    fn status_line_uses_known_reason_phrase() {
        assert_eq!(format_status_line(200), b"HTTP/1.1 200 OK\r\n".to_vec());
    }

    #[test]
    fn listen_then_dispatch_returns_bound_port() {
        std::env::set_var("ZI_NET_LISTEN_ALLOW", "any");
        let runtime = Arc::new(Runtime::new_native());
        let id = open(&runtime, &OpenRequest { kind: "net", name: "http", version: 1, params: &[] }).unwrap();
        let ops = runtime.handles.lookup(id).unwrap();

        let mut payload = BytesMut::new();
        payload.put_u32_le(0); // ephemeral port
        payload.put_u32_le(0); // flags
        put_str(&mut payload, "127.0.0.1");
        let mut req_buf = vec![0_u8; 24 + payload.len()];
        let n = zingcore_wire::write_ok(&mut req_buf, ops::LISTEN, 1, &payload).unwrap();
        ops.write(&req_buf[..n]).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let mut out = [0_u8; 256];
        let read_n = ops.read(&mut out).expect("listen response should be queued");
        let parsed = zingcore_wire::parse(&out[..read_n]).unwrap();
        assert!(parsed.header.is_ok());
        let mut body = parsed.payload;
        let listener_id = body.get_u32_le();
        assert!(listener_id >= 1);
    }

    #[test]
    fn chunked_request_body_streams_instead_of_buffering_fully() {
        std::env::set_var("ZI_NET_LISTEN_ALLOW", "any");
        let runtime = Arc::new(Runtime::new_native());
        let id = open(&runtime, &OpenRequest { kind: "net", name: "http", version: 1, params: &[] }).unwrap();
        let ops = runtime.handles.lookup(id).unwrap();

        let mut listen_payload = BytesMut::new();
        listen_payload.put_u32_le(0);
        listen_payload.put_u32_le(0);
        put_str(&mut listen_payload, "127.0.0.1");
        let mut req_buf = vec![0_u8; 24 + listen_payload.len()];
        let n = zingcore_wire::write_ok(&mut req_buf, ops::LISTEN, 1, &listen_payload).unwrap();
        ops.write(&req_buf[..n]).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let mut out = [0_u8; 256];
        let n = ops.read(&mut out).expect("listen response should be queued");
        let parsed = zingcore_wire::parse(&out[..n]).unwrap();
        let mut body = parsed.payload;
        let expected_listener_id = body.get_u32_le();
        let port = body.get_u32_le();

        let mut client = std::net::TcpStream::connect(("127.0.0.1", port as u16)).unwrap();
        client
            .write_all(b"POST /up HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nfoo\r\n")
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let mut out = [0_u8; 512];
        let n = ops.read(&mut out).expect("EV_REQUEST should be queued once the head is parsed");
        let ev = zingcore_wire::parse(&out[..n]).unwrap();
        assert_eq!(ev.header.op(), ops::EV_REQUEST);
        let mut body = ev.payload;
        let listener_id = body.get_u32_le();
        assert_eq!(listener_id, expected_listener_id);
        let _flags = body.get_u32_le();
        let _method = get_str(&mut body).unwrap();
        let _path = get_str(&mut body).unwrap();
        let _scheme = get_str(&mut body).unwrap();
        let _authority = get_str(&mut body).unwrap();
        let mut remote_addr = [0_u8; 16];
        remote_addr.copy_from_slice(&body[..16]);
        body.advance(16);
        let remote_port = body.get_u32_le();
        assert_ne!(remote_addr, [0_u8; 16]);
        assert_ne!(remote_port, 0);
        let header_count = body.get_u32_le();
        for _ in 0..header_count {
            let _ = get_str(&mut body).unwrap();
            let _ = get_str(&mut body).unwrap();
        }
        let body_kind_val = body.get_u32_le();
        assert_eq!(body_kind_val, body_kind::STREAM, "chunked requests must stream, not buffer fully");
        let handle = body.get_u32_le();

        // The terminating chunk hasn't arrived yet; the first three decoded
        // bytes should already be readable without it.
        let stream = runtime.handles.lookup(handle).unwrap();
        let mut buf = [0_u8; 16];
        let mut collected = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(CoreError::Again) => {
                    assert!(std::time::Instant::now() < deadline, "timed out waiting for chunked body");
                    std::thread::sleep(Duration::from_millis(10));
                },
                Err(e) => panic!("unexpected error reading chunked body: {e:?}"),
            }
            if collected == b"foo" {
                client.write_all(b"0\r\n\r\n").unwrap();
            }
        }
        assert_eq!(collected, b"foo");
    }
}
