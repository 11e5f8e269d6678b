//! `file/aio`: a bounded submission queue drained by a worker-thread pool,
//! mirroring the background-thread-plus-notify-pipe shape used by the HTTP
//! capability's listener, but with a fixed pool rather than one thread per
//! handle.

use std::collections::{HashMap, VecDeque};
use std::io::{Read as _, Write as _};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use mio::unix::pipe;
use zingcore_core::handle::Pollable;
use zingcore_core::registry::{cflags, CapDescriptor, OpenRequest};
use zingcore_core::{hflags, CoreError, HandleOps, PollOps, Runtime};

use crate::error::CapsError;
use crate::limits::Limits;

/// `file/aio` op codes.
pub mod ops {
    /// `OPEN(path, flags) -> fd`.
    pub const OPEN: u16 = 1;
    /// `CLOSE(fd)`.
    pub const CLOSE: u16 = 2;
    /// `READ(fd, offset, len)`.
    pub const READ: u16 = 3;
    /// `WRITE(fd, offset, data)`.
    pub const WRITE: u16 = 4;
    /// `MKDIR(path)`.
    pub const MKDIR: u16 = 5;
    /// `RMDIR(path)`.
    pub const RMDIR: u16 = 6;
    /// `UNLINK(path)`.
    pub const UNLINK: u16 = 7;
    /// `STAT(path)`.
    pub const STAT: u16 = 8;
    /// `READDIR(path)`.
    pub const READDIR: u16 = 9;
    /// Server-pushed: the submission named by `req_id` completed.
    pub const EV_DONE: u16 = 100;
}

/// `OPEN` flag bits.
pub mod open_flags {
    /// Open for reading.
    pub const O_READ: u32 = 0x1;
    /// Open for writing.
    pub const O_WRITE: u32 = 0x2;
    /// Create the file if it does not exist.
    pub const O_CREATE: u32 = 0x4;
    /// Truncate an existing file to zero length.
    pub const O_TRUNC: u32 = 0x8;
}

/// `STAT` response flag bits.
pub mod stat_flags {
    /// The path names a directory rather than a regular file.
    pub const IS_DIR: u32 = 0x1;
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

/// An accepted submission, queued until a worker picks it up.
struct Job {
    req_id: u64,
    op: u16,
    payload: BytesMut,
}

struct FileTable {
    next_fd: u32,
    open: HashMap<u32, std::fs::File>,
}

impl FileTable {
    fn new() -> Self {
        Self { next_fd: 1, open: HashMap::new() }
    }
}

struct State {
    queue: VecDeque<Job>,
    files: FileTable,
    out: VecDeque<u8>,
}

struct Shared {
    limits: Limits,
    state: Mutex<State>,
    has_job: Condvar,
    notify_w: Mutex<pipe::Sender>,
    notify_r: Mutex<pipe::Receiver>,
    shutdown: AtomicBool,
}

impl Shared {
    fn push_frame(&self, frame: &[u8]) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).out.extend(frame.iter().copied());
        let mut w = self.notify_w.lock().unwrap_or_else(|e| e.into_inner());
        let _ = w.write(&[1]);
    }

    fn push_done(&self, req_id: u64, orig_op: u16, result: i64, extra: &[u8]) {
        let mut body = BytesMut::with_capacity(16 + extra.len());
        body.put_u16_le(orig_op);
        body.put_u16_le(0);
        body.put_u64_le(req_id);
        body.put_i64_le(result);
        body.put_u32_le(extra.len() as u32);
        body.put_slice(extra);
        let mut frame = BytesMut::zeroed(zingcore_wire::HEADER_LEN + body.len());
        let n = zingcore_wire::write_ok(&mut frame, ops::EV_DONE, 0, &body).unwrap_or(0);
        frame.truncate(n);
        self.push_frame(&frame);
    }
}

/// The `file/aio` capability's control-channel handle.
pub struct FileAioCap {
    shared: Arc<Shared>,
}

impl FileAioCap {
    fn dispatch(&self, op: u16, rid: u32, payload: &[u8]) -> Result<BytesMut, CapsError> {
        match op {
            ops::OPEN | ops::CLOSE | ops::READ | ops::WRITE | ops::MKDIR | ops::RMDIR | ops::UNLINK | ops::STAT
            | ops::READDIR => self.submit(op, rid, payload),
            _ => Err(CapsError::Core(CoreError::Nosys)),
        }
    }

    fn submit(&self, op: u16, rid: u32, payload: &[u8]) -> Result<BytesMut, CapsError> {
        if payload.len() < 8 {
            return Err(CapsError::MalformedPayload);
        }
        let req_id = (&payload[..8]).get_u64_le();
        if req_id == 0 {
            return Err(CapsError::ZeroId);
        }
        let body = payload[8..].to_vec();

        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.queue.len() >= self.shared.limits.file_aio_queue_cap {
            return Err(CapsError::QueueFull);
        }
        state.queue.push_back(Job { req_id, op, payload: BytesMut::from(&body[..]) });
        drop(state);
        self.shared.has_job.notify_one();

        let mut out = BytesMut::with_capacity(8);
        out.put_u64_le(req_id);
        let _ = rid;
        Ok(out)
    }
}

fn run_job(shared: &Shared, job: Job) {
    let result = run_job_inner(shared, job.op, &job.payload);
    match result {
        Ok(extra) => shared.push_done(job.req_id, job.op, 0, &extra),
        Err(err) => {
            let mut extra = BytesMut::new();
            put_str(&mut extra, err.trace());
            put_str(&mut extra, &err.to_string());
            shared.push_done(job.req_id, job.op, -1, &extra);
        },
    }
}

fn run_job_inner(shared: &Shared, op: u16, payload: &[u8]) -> Result<BytesMut, CapsError> {
    let mut p = payload;
    match op {
        ops::OPEN => {
            let path = get_str(&mut p).ok_or(CapsError::MalformedPayload)?;
            if p.len() < 4 {
                return Err(CapsError::MalformedPayload);
            }
            let flags = p.get_u32_le();
            let mut opts = std::fs::OpenOptions::new();
            opts.read(flags & open_flags::O_READ != 0);
            opts.write(flags & open_flags::O_WRITE != 0);
            opts.create(flags & open_flags::O_CREATE != 0);
            opts.truncate(flags & open_flags::O_TRUNC != 0);
            let file = opts.open(&path).map_err(|e| CapsError::Core(CoreError::Io(e.to_string())))?;
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            let fd = state.files.next_fd;
            state.files.next_fd += 1;
            state.files.open.insert(fd, file);
            let mut out = BytesMut::with_capacity(4);
            out.put_u32_le(fd);
            Ok(out)
        },
        ops::CLOSE => {
            let fd = read_fd(&mut p)?;
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.files.open.remove(&fd).ok_or_else(|| CapsError::Core(CoreError::Noent(format!("no such fd {fd}"))))?;
            Ok(BytesMut::new())
        },
        ops::READ => {
            let fd = read_fd(&mut p)?;
            if p.len() < 12 {
                return Err(CapsError::MalformedPayload);
            }
            let offset = p.get_u64_le();
            let len = p.get_u32_le() as usize;
            let mut file = clone_fd(shared, fd)?;
            use std::io::{Seek, SeekFrom};
            file.seek(SeekFrom::Start(offset)).map_err(|e| CapsError::Core(CoreError::Io(e.to_string())))?;
            let mut data = vec![0_u8; len];
            let n = file.read(&mut data).map_err(|e| CapsError::Core(CoreError::Io(e.to_string())))?;
            data.truncate(n);
            let mut out = BytesMut::with_capacity(4 + data.len());
            out.put_u32_le(data.len() as u32);
            out.put_slice(&data);
            Ok(out)
        },
        ops::WRITE => {
            let fd = read_fd(&mut p)?;
            if p.len() < 12 {
                return Err(CapsError::MalformedPayload);
            }
            let offset = p.get_u64_le();
            let data_len = p.get_u32_le() as usize;
            if p.len() < data_len {
                return Err(CapsError::MalformedPayload);
            }
            let data = &p[..data_len];
            let mut file = clone_fd(shared, fd)?;
            use std::io::{Seek, SeekFrom};
            file.seek(SeekFrom::Start(offset)).map_err(|e| CapsError::Core(CoreError::Io(e.to_string())))?;
            file.write_all(data).map_err(|e| CapsError::Core(CoreError::Io(e.to_string())))?;
            let mut out = BytesMut::with_capacity(4);
            out.put_u32_le(data_len as u32);
            Ok(out)
        },
        ops::MKDIR => {
            let path = get_str(&mut p).ok_or(CapsError::MalformedPayload)?;
            std::fs::create_dir(&path).map_err(|e| CapsError::Core(CoreError::Io(e.to_string())))?;
            Ok(BytesMut::new())
        },
        ops::RMDIR => {
            let path = get_str(&mut p).ok_or(CapsError::MalformedPayload)?;
            std::fs::remove_dir(&path).map_err(|e| CapsError::Core(CoreError::Io(e.to_string())))?;
            Ok(BytesMut::new())
        },
        ops::UNLINK => {
            let path = get_str(&mut p).ok_or(CapsError::MalformedPayload)?;
            std::fs::remove_file(&path).map_err(|e| CapsError::Core(CoreError::Io(e.to_string())))?;
            Ok(BytesMut::new())
        },
        ops::STAT => {
            let path = get_str(&mut p).ok_or(CapsError::MalformedPayload)?;
            let meta = std::fs::metadata(&path).map_err(|e| CapsError::Core(CoreError::Io(e.to_string())))?;
            let mut out = BytesMut::with_capacity(16);
            out.put_u64_le(meta.len());
            out.put_u32_le(if meta.is_dir() { stat_flags::IS_DIR } else { 0 });
            out.put_u32_le(0);
            Ok(out)
        },
        ops::READDIR => {
            let path = get_str(&mut p).ok_or(CapsError::MalformedPayload)?;
            let entries = std::fs::read_dir(&path).map_err(|e| CapsError::Core(CoreError::Io(e.to_string())))?;
            let mut names = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| CapsError::Core(CoreError::Io(e.to_string())))?;
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            let mut out = BytesMut::new();
            out.put_u32_le(names.len() as u32);
            for name in names {
                put_str(&mut out, &name);
            }
            Ok(out)
        },
        _ => Err(CapsError::Core(CoreError::Nosys)),
    }
}

fn read_fd(p: &mut &[u8]) -> Result<u32, CapsError> {
    if p.len() < 4 {
        return Err(CapsError::MalformedPayload);
    }
    Ok(p.get_u32_le())
}

/// `READ`/`WRITE` need their own positioned handle; `File::try_clone` shares
/// the underlying descriptor without taking the file table lock for the
/// whole duration of the blocking I/O call.
fn clone_fd(shared: &Shared, fd: u32) -> Result<std::fs::File, CapsError> {
    let state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
    let file = state.files.open.get(&fd).ok_or_else(|| CapsError::Core(CoreError::Noent(format!("no such fd {fd}"))))?;
    file.try_clone().map_err(|e| CapsError::Core(CoreError::Io(e.to_string())))
}

fn worker_thread(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                let (guard, _timeout) =
                    shared.has_job.wait_timeout(state, Duration::from_millis(250)).unwrap_or_else(|e| e.into_inner());
                state = guard;
            }
        };
        run_job(&shared, job);
    }
}

impl HandleOps for FileAioCap {
    fn read(&self, buf: &mut [u8]) -> Result<usize, CoreError> {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
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
            Ok(response) => {
                let mut f = BytesMut::zeroed(zingcore_wire::HEADER_LEN + response.len());
                let n = zingcore_wire::write_ok(&mut f, op, rid, &response).unwrap_or(0);
                f.truncate(n);
                f
            },
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
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner()).out.extend(response.iter().copied());
        let mut w = self.shared.notify_w.lock().unwrap_or_else(|e| e.into_inner());
        let _ = w.write(&[1]);
        Ok(consumed)
    }

    fn end(&self) -> Result<(), CoreError> {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.has_job.notify_all();
        Ok(())
    }
}

impl PollOps for FileAioCap {
    fn pollable(&self) -> Pollable {
        let wakeup_fd = self.shared.notify_r.lock().unwrap_or_else(|e| e.into_inner()).as_raw_fd();
        Pollable::Computed { wakeup_fd }
    }

    fn get_ready(&self) -> u32 {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut ready = 0;
        if !state.out.is_empty() {
            ready |= zingcore_wire::event::READABLE;
        }
        if state.queue.len() < self.shared.limits.file_aio_queue_cap {
            ready |= zingcore_wire::event::WRITABLE;
        }
        ready
    }

    fn drain_wakeup(&self) {
        let mut r = self.shared.notify_r.lock().unwrap_or_else(|e| e.into_inner());
        let mut scratch = [0_u8; 64];
        while matches!((&mut *r).read(&mut scratch), Ok(n) if n > 0) {}
    }
}

/// The `(kind="file", name="aio")` descriptor.
#[must_use]
pub fn descriptor() -> CapDescriptor {
    CapDescriptor {
        kind: "file".into(),
        name: "aio".into(),
        version: 1,
        flags: cflags::CAN_OPEN | cflags::MAY_BLOCK,
        meta: bytes::Bytes::new(),
    }
}

/// Open a `file/aio` handle, spinning up its worker pool.
pub fn open(runtime: &Arc<Runtime>, _req: &OpenRequest<'_>) -> Result<u32, CoreError> {
    let (sender, receiver) = pipe::new().map_err(|e| CoreError::Io(e.to_string()))?;
    sender.set_nonblocking(true).ok();
    receiver.set_nonblocking(true).ok();

    let limits = Limits::from_env();
    let shared = Arc::new(Shared {
        limits,
        state: Mutex::new(State { queue: VecDeque::new(), files: FileTable::new(), out: VecDeque::new() }),
        has_job: Condvar::new(),
        notify_w: Mutex::new(sender),
        notify_r: Mutex::new(receiver),
        shutdown: AtomicBool::new(false),
    });

    for i in 0..limits.file_aio_workers {
        let shared = shared.clone();
        std::thread::Builder::new()
            .name(format!("zingcore-file-aio-{i}"))
            .spawn(move || worker_thread(shared))
            .map_err(|e| CoreError::Io(e.to_string()))?;
    }

    let cap = Arc::new(FileAioCap { shared });
    let id = runtime.handles.alloc_with_poll(cap.clone(), cap, hflags::READABLE | hflags::WRITABLE | hflags::ENDABLE);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use zingcore_wire::parse;

    use super::*;

    fn make_shared() -> Arc<Shared> {
        let (sender, receiver) = pipe::new().unwrap();
        Arc::new(Shared {
            limits: Limits { file_aio_queue_cap: 2, file_aio_workers: 1, ..Limits::from_env() },
            state: Mutex::new(State { queue: VecDeque::new(), files: FileTable::new(), out: VecDeque::new() }),
            has_job: Condvar::new(),
            notify_w: Mutex::new(sender),
            notify_r: Mutex::new(receiver),
            shutdown: AtomicBool::new(false),
        })
    }

    #[test]
    fn submit_ack_echoes_req_id() {
        let shared = make_shared();
        let cap = FileAioCap { shared };
        let tmp = tempfile_path();
        let mut payload = BytesMut::new();
        payload.put_u64_le(42);
        put_str(&mut payload, &tmp);
        payload.put_u32_le(open_flags::O_READ | open_flags::O_WRITE | open_flags::O_CREATE);
        let ack = cap.dispatch(ops::OPEN, 1, &payload).unwrap();
        let req_id = (&ack[..]).get_u64_le();
        assert_eq!(req_id, 42);
    }

    #[test]
    fn queue_full_is_rejected() {
        let shared = make_shared();
        let cap = FileAioCap { shared };

        let tmp = tempfile_path();
        let mut payload = BytesMut::new();
        payload.put_u64_le(1);
        put_str(&mut payload, &tmp);
        payload.put_u32_le(open_flags::O_READ);
        cap.dispatch(ops::OPEN, 1, &payload).unwrap();

        let mut payload2 = BytesMut::new();
        payload2.put_u64_le(2);
        put_str(&mut payload2, &tmp);
        payload2.put_u32_le(open_flags::O_READ);
        cap.dispatch(ops::OPEN, 2, &payload2).unwrap();

        let mut payload3 = BytesMut::new();
        payload3.put_u64_le(3);
        put_str(&mut payload3, &tmp);
        payload3.put_u32_le(open_flags::O_READ);
        assert!(matches!(cap.dispatch(ops::OPEN, 3, &payload3), Err(CapsError::QueueFull)));
    }

    #[test]
    fn writable_reflects_queue_capacity() {
        let shared = make_shared();
        let cap = FileAioCap { shared };
        let tmp = tempfile_path();

        assert_ne!(cap.get_ready() & zingcore_wire::event::WRITABLE, 0);

        let mut payload1 = BytesMut::new();
        payload1.put_u64_le(1);
        put_str(&mut payload1, &tmp);
        payload1.put_u32_le(open_flags::O_READ);
        cap.dispatch(ops::OPEN, 1, &payload1).unwrap();

        let mut payload2 = BytesMut::new();
        payload2.put_u64_le(2);
        put_str(&mut payload2, &tmp);
        payload2.put_u32_le(open_flags::O_READ);
        cap.dispatch(ops::OPEN, 2, &payload2).unwrap();

        assert_eq!(cap.get_ready() & zingcore_wire::event::WRITABLE, 0);

        cap.shared.state.lock().unwrap_or_else(|e| e.into_inner()).queue.pop_front();
        assert_ne!(cap.get_ready() & zingcore_wire::event::WRITABLE, 0);
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("zingcore-caps-test-{}", std::process::id()));
        let path_str = path.to_string_lossy().into_owned();
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(b"hello").unwrap();
        }

        let shared = make_shared();
        let mut file_opts = std::fs::OpenOptions::new();
        let file = file_opts.read(true).write(true).open(&path).unwrap();
        let fd = {
            let mut state = shared.state.lock().unwrap();
            let fd = state.files.next_fd;
            state.files.next_fd += 1;
            state.files.open.insert(fd, file);
            fd
        };

        let mut read_payload = BytesMut::new();
        read_payload.put_u32_le(fd);
        read_payload.put_u64_le(0);
        read_payload.put_u32_le(5);
        let result = run_job_inner(&shared, ops::READ, &read_payload).unwrap();
        let mut body = result;
        let len = body.get_u32_le();
        assert_eq!(len, 5);
        assert_eq!(&body[..5], b"hello");

        std::fs::remove_file(&path).ok();
        let _ = path_str;
    }

    #[test]
    fn descriptor_advertises_file_aio() {
        let d = descriptor();
        assert_eq!(d.kind, "file");
        assert_eq!(d.name, "aio");
    }

    #[test]
    fn done_event_frame_carries_req_id() {
        let shared = make_shared();
        shared.push_done(99, ops::STAT, -1, b"");
        let mut out = shared.state.lock().unwrap().out.clone();
        let bytes: Vec<u8> = out.drain(..).collect();
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.header.op(), ops::EV_DONE);
        let mut body = parsed.payload;
        let _orig_op = body.get_u16_le();
        let _reserved = body.get_u16_le();
        let req_id = body.get_u64_le();
        assert_eq!(req_id, 99);
    }

    fn tempfile_path() -> String {
        let dir = std::env::temp_dir();
        dir.join(format!("zingcore-caps-test-open-{}-{}", std::process::id(), rand_suffix())).to_string_lossy().into_owned()
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos() as u64).unwrap_or(0)
    }
}
