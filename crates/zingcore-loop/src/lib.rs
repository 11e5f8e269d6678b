//! `sys/loop`: the scheduler that watches handles for readiness and drives
//! timers.
//!
//! A loop handle carries a single ZCL1 control stream with five ops: `WATCH`,
//! `UNWATCH`, `TIMER_ARM`, `TIMER_CANCEL`, `POLL`. Guests `write` a request
//! frame and `read` the response frame it produces.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, warn};
use zingcore_core::handle::Pollable;
use zingcore_core::registry::{cflags, CapDescriptor, OpenRequest};
use zingcore_core::{CoreError, HandleOps, Runtime};
use zingcore_wire::event::{self, EventRecord};
use zingcore_wire::{parse, write_error, write_ok};

pub use error::LoopError;

/// `sys/loop` op codes.
pub mod ops {
    /// Register a watch on a handle.
    pub const WATCH: u16 = 1;
    /// Remove a watch.
    pub const UNWATCH: u16 = 2;
    /// Arm (or re-arm) a timer.
    pub const TIMER_ARM: u16 = 3;
    /// Cancel a timer.
    pub const TIMER_CANCEL: u16 = 4;
    /// Poll for ready events and due timers.
    pub const POLL: u16 = 5;
}

/// Minimum static capacity for watches and timers per loop handle.
pub const CAPACITY: usize = 1024;

/// `timeout_ms` value meaning "block indefinitely".
pub const TIMEOUT_BLOCK: u32 = u32::MAX;

/// Response payload `flags` bit: more events/timers are pending beyond this
/// batch.
pub const FLAG_MORE_PENDING: u32 = 0x1;

/// `TIMER_ARM` request flag bit: `due_ns` is relative to now, not absolute.
pub const ARM_RELATIVE: u32 = 0x1;

struct Watch {
    handle: u32,
    mask: u32,
}

struct Timer {
    due_ns: u64,
    interval_ns: u64,
}

struct LoopState {
    watches: HashMap<u64, Watch>,
    timers: HashMap<u64, Timer>,
    out: VecDeque<u8>,
}

/// The event loop capability: a readiness/timer scheduler over a set of
/// watched handles from the same runtime.
pub struct LoopCap {
    runtime: Arc<Runtime>,
    state: Mutex<LoopState>,
    created_at: Instant,
}

impl LoopCap {
    fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            state: Mutex::new(LoopState {
                watches: HashMap::new(),
                timers: HashMap::new(),
                out: VecDeque::new(),
            }),
            created_at: Instant::now(),
        }
    }

    fn now_ns(&self) -> u64 {
        u64::try_from(self.created_at.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn push_frame(&self, state: &mut LoopState, bytes: &[u8]) {
        state.out.extend(bytes.iter().copied());
    }

    fn handle_request(&self, buf: &[u8]) -> Result<usize, CoreError> {
        let frame = parse(buf).map_err(|e| CoreError::Invalid(e.to_string()))?;
        let op = frame.header.op();
        let rid = frame.header.rid();
        let payload = frame.header.payload_len() as usize;
        let consumed = zingcore_wire::HEADER_LEN + payload;

        let result = self.dispatch(op, rid, frame.payload);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(response) => self.push_frame(&mut state, &response),
            Err(err) => {
                let mut tmp = vec![0_u8; 256 + err.to_string().len()];
                let n = write_error(&mut tmp, op, rid, err.trace().as_bytes(), err.to_string().as_bytes(), b"")
                    .unwrap_or(0);
                self.push_frame(&mut state, &tmp[..n]);
            },
        }
        Ok(consumed)
    }

    fn dispatch(&self, op: u16, rid: u32, payload: &[u8]) -> Result<BytesMut, LoopError> {
        match op {
            ops::WATCH => self.op_watch(op, rid, payload),
            ops::UNWATCH => self.op_unwatch(op, rid, payload),
            ops::TIMER_ARM => self.op_timer_arm(op, rid, payload),
            ops::TIMER_CANCEL => self.op_timer_cancel(op, rid, payload),
            ops::POLL => self.op_poll(op, rid, payload),
            _ => Err(LoopError::Core(CoreError::Nosys)),
        }
    }

    fn ok_empty(op: u16, rid: u32) -> BytesMut {
        let mut buf = BytesMut::zeroed(zingcore_wire::HEADER_LEN);
        let n = write_ok(&mut buf, op, rid, &[]).unwrap_or(0);
        buf.truncate(n);
        buf
    }

    fn op_watch(&self, op: u16, rid: u32, payload: &[u8]) -> Result<BytesMut, LoopError> {
        if payload.len() != 20 {
            return Err(LoopError::MalformedPayload);
        }
        let mut p = payload;
        let handle = p.get_u32_le();
        let mask = p.get_u32_le();
        let watch_id = p.get_u64_le();
        let _flags = p.get_u32_le();
        if watch_id == 0 {
            return Err(LoopError::ZeroId);
        }
        if self.runtime.handles.lookup_poll(handle).is_none() {
            return Err(LoopError::NotPollable);
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.watches.len() >= CAPACITY && !state.watches.contains_key(&watch_id) {
            return Err(LoopError::Full);
        }
        state.watches.insert(watch_id, Watch { handle, mask });
        drop(state);
        debug!(watch_id, handle, mask, "watch registered");
        Ok(Self::ok_empty(op, rid))
    }

    fn op_unwatch(&self, op: u16, rid: u32, payload: &[u8]) -> Result<BytesMut, LoopError> {
        if payload.len() != 8 {
            return Err(LoopError::MalformedPayload);
        }
        let watch_id = (&payload[..]).get_u64_le();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.watches.remove(&watch_id);
        drop(state);
        Ok(Self::ok_empty(op, rid))
    }

    fn op_timer_arm(&self, op: u16, rid: u32, payload: &[u8]) -> Result<BytesMut, LoopError> {
        if payload.len() != 28 {
            return Err(LoopError::MalformedPayload);
        }
        let mut p = payload;
        let timer_id = p.get_u64_le();
        let due = p.get_u64_le();
        let interval_ns = p.get_u64_le();
        let flags = p.get_u32_le();
        if timer_id == 0 {
            return Err(LoopError::ZeroId);
        }
        let now = self.now_ns();
        let due_ns = if flags & ARM_RELATIVE != 0 { now.saturating_add(due) } else { due };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.timers.len() >= CAPACITY && !state.timers.contains_key(&timer_id) {
            return Err(LoopError::Full);
        }
        state.timers.insert(timer_id, Timer { due_ns, interval_ns });
        drop(state);
        Ok(Self::ok_empty(op, rid))
    }

    fn op_timer_cancel(&self, op: u16, rid: u32, payload: &[u8]) -> Result<BytesMut, LoopError> {
        if payload.len() != 8 {
            return Err(LoopError::MalformedPayload);
        }
        let timer_id = (&payload[..]).get_u64_le();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.timers.remove(&timer_id);
        drop(state);
        Ok(Self::ok_empty(op, rid))
    }

    fn op_poll(&self, op: u16, rid: u32, payload: &[u8]) -> Result<BytesMut, LoopError> {
        if payload.len() != 8 {
            return Err(LoopError::MalformedPayload);
        }
        let mut p = payload;
        let max_events = p.get_u32_le();
        let timeout_ms = p.get_u32_le();

        let (ready, timers, more_pending) = self.run_poll(max_events, timeout_ms);

        let mut out = BytesMut::new();
        out.put_u32_le(1); // version
        out.put_u32_le(if more_pending { FLAG_MORE_PENDING } else { 0 });
        out.put_u32_le((ready.len() + timers.len()) as u32);
        for record in ready.iter().chain(timers.iter()) {
            out.put_slice(zerocopy::IntoBytes::as_bytes(record));
        }

        let mut frame = BytesMut::zeroed(zingcore_wire::HEADER_LEN + out.len());
        let n = write_ok(&mut frame, op, rid, &out).map_err(|e| LoopError::Core(CoreError::Bounds(e.to_string())))?;
        frame.truncate(n);
        Ok(frame)
    }

    /// Run one poll pass: build the fd set from current watches, wait up to
    /// the effective timeout, and collect ready/timer events.
    fn run_poll(&self, max_events: u32, timeout_ms: u32) -> (Vec<EventRecord>, Vec<EventRecord>, bool) {
        let now = self.now_ns();

        // Snapshot watch/timer state and resolve poll hooks while unlocked
        // from the mio call, so a capability's own lock (e.g. HTTP's
        // recursive mutex) is never held across poll().
        let (watch_snapshot, next_timer_due) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let snapshot: Vec<(u64, u32, u32)> =
                state.watches.iter().map(|(id, w)| (*id, w.handle, w.mask)).collect();
            let next_due = state.timers.values().map(|t| t.due_ns).min();
            (snapshot, next_due)
        };

        let mut resolved = Vec::with_capacity(watch_snapshot.len());
        for (watch_id, handle, mask) in watch_snapshot {
            if let Some(poll_ops) = self.runtime.handles.lookup_poll(handle) {
                resolved.push((watch_id, handle, mask, poll_ops));
            }
        }

        let requested_ns =
            if timeout_ms == TIMEOUT_BLOCK { None } else { Some(u64::from(timeout_ms) * 1_000_000) };
        let timer_ns = next_timer_due.map(|due| due.saturating_sub(now));
        let mut effective_ns = match (requested_ns, timer_ns) {
            (Some(r), Some(t)) => Some(r.min(t)),
            (Some(r), None) => Some(r),
            (None, Some(t)) => Some(t),
            (None, None) => None,
        };

        let any_already_ready = resolved.iter().any(|(_, _, mask, poll_ops)| {
            matches!(poll_ops.pollable(), Pollable::Computed { .. }) && poll_ops.get_ready() & mask != 0
        });
        if any_already_ready {
            effective_ns = Some(0);
        }

        let mut poll = match Poll::new() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to create mio poller");
                return (Vec::new(), Vec::new(), false);
            },
        };
        let registry = poll.registry();
        for (watch_id, _handle, mask, poll_ops) in &resolved {
            let token = Token(*watch_id as usize);
            let mut interest = Interest::READABLE;
            if mask & event::WRITABLE != 0 {
                interest = interest.add(Interest::WRITABLE);
            }
            let fd = match poll_ops.pollable() {
                Pollable::Fd(fd) | Pollable::Computed { wakeup_fd: fd } => fd,
            };
            let mut source = SourceFd(&fd);
            if let Err(e) = registry.register(&mut source, token, interest) {
                warn!(error = %e, watch_id, "failed to register fd with poller");
            }
        }

        let mut events = Events::with_capacity(resolved.len().max(1));
        let timeout = effective_ns.map(Duration::from_nanos);
        if let Err(e) = poll.poll(&mut events, timeout) {
            // mio retries EINTR internally; any other error is treated as a
            // spurious empty wake, matching the reference loop's tolerance.
            debug!(error = %e, "poll() returned an error; treating as spurious wake");
        }

        let mut readable_tokens = std::collections::HashSet::new();
        let mut fd_events: HashMap<usize, u32> = HashMap::new();
        for ev in events.iter() {
            let token = ev.token().0;
            if ev.is_readable() {
                readable_tokens.insert(token);
            }
            let mut mask = 0_u32;
            if ev.is_readable() {
                mask |= event::READABLE;
            }
            if ev.is_writable() {
                mask |= event::WRITABLE;
            }
            if ev.is_read_closed() || ev.is_write_closed() {
                mask |= event::HUP;
            }
            if ev.is_error() {
                mask |= event::ERROR;
            }
            fd_events.insert(token, mask);
        }

        let now_after = self.now_ns();
        let mut ready_events = Vec::new();
        for (watch_id, handle, mask, poll_ops) in &resolved {
            let token = *watch_id as usize;
            let observed = match poll_ops.pollable() {
                Pollable::Fd(_) => fd_events.get(&token).copied().unwrap_or(0) & mask,
                Pollable::Computed { .. } => {
                    if readable_tokens.contains(&token) {
                        poll_ops.drain_wakeup();
                    }
                    let computed = poll_ops.get_ready() & mask;
                    let hup_err = fd_events.get(&token).copied().unwrap_or(0) & (event::HUP | event::ERROR);
                    computed | hup_err
                },
            };
            if observed != 0 {
                ready_events.push(EventRecord::new(event::KIND_READY, observed, *handle, *watch_id, now_after));
            }
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let due_ids: Vec<u64> =
            state.timers.iter().filter(|(_, t)| t.due_ns <= now_after).map(|(id, _)| *id).collect();
        let mut timer_events = Vec::new();
        for id in due_ids {
            if let Some(timer) = state.timers.get_mut(&id) {
                timer_events.push(EventRecord::new(event::KIND_TIMER, 0, 0, id, now_after));
                if timer.interval_ns == 0 {
                    state.timers.remove(&id);
                } else {
                    timer.due_ns = now_after.saturating_add(timer.interval_ns);
                }
            }
        }
        drop(state);

        let total = ready_events.len() + timer_events.len();
        let cap = max_events as usize;
        let more_pending = total > cap;
        ready_events.truncate(cap);
        let remaining = cap.saturating_sub(ready_events.len());
        timer_events.truncate(remaining);

        (ready_events, timer_events, more_pending)
    }
}

impl HandleOps for LoopCap {
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
        self.handle_request(buf)
    }

    fn end(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// The `(kind="sys", name="loop")` descriptor and open function, for
/// registration with a [`zingcore_core::CapabilityRegistry`].
#[must_use]
pub fn descriptor() -> CapDescriptor {
    CapDescriptor {
        kind: "sys".into(),
        name: "loop".into(),
        version: 1,
        flags: cflags::CAN_OPEN,
        meta: bytes::Bytes::new(),
    }
}

/// Open a new loop handle. Ignores `params` (the loop capability takes none).
pub fn open(runtime: &Arc<Runtime>, _req: &OpenRequest<'_>) -> Result<u32, CoreError> {
    let cap = Arc::new(LoopCap::new(runtime.clone()));
    let id = runtime.handles.alloc(cap, zingcore_core::hflags::READABLE | zingcore_core::hflags::WRITABLE);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use zingcore_core::handle::PollOps;
    use zingcore_wire::{parse, write_ok};

    use super::*;

    fn make_loop() -> (Arc<Runtime>, Arc<LoopCap>) {
        let runtime = Arc::new(Runtime::new_native());
        let cap = Arc::new(LoopCap::new(runtime.clone()));
        (runtime, cap)
    }

    fn send(cap: &LoopCap, op: u16, rid: u32, payload: &[u8]) -> Vec<u8> {
        let mut req = vec![0_u8; zingcore_wire::HEADER_LEN + payload.len()];
        let n = write_ok(&mut req, op, rid, payload).unwrap();
        cap.write(&req[..n]).unwrap();
        let mut out = vec![0_u8; 4096];
        let n = cap.read(&mut out).unwrap();
        out.truncate(n);
        out
    }

    struct FdPoll(std::net::UdpSocket);
    impl PollOps for FdPoll {
        fn pollable(&self) -> Pollable {
            Pollable::Fd(self.0.as_raw_fd())
        }
    }

    #[test]
    fn watch_on_non_pollable_handle_fails() {
        let (runtime, cap) = make_loop();
        struct Dummy;
        impl HandleOps for Dummy {
            fn read(&self, _buf: &mut [u8]) -> Result<usize, CoreError> {
                Ok(0)
            }
            fn write(&self, b: &[u8]) -> Result<usize, CoreError> {
                Ok(b.len())
            }
            fn end(&self) -> Result<(), CoreError> {
                Ok(())
            }
        }
        let handle = runtime.handles.alloc(Arc::new(Dummy), 0);

        let mut payload = Vec::new();
        payload.extend_from_slice(&handle.to_le_bytes());
        payload.extend_from_slice(&1_u32.to_le_bytes());
        payload.extend_from_slice(&1_u64.to_le_bytes());
        payload.extend_from_slice(&0_u32.to_le_bytes());

        let resp = send(&cap, ops::WATCH, 1, &payload);
        let parsed = parse(&resp).unwrap();
        assert!(!parsed.header.is_ok());
    }

    #[test]
    fn timer_fires_once_for_one_shot() {
        let (_runtime, cap) = make_loop();
        let mut payload = Vec::new();
        payload.extend_from_slice(&1_u64.to_le_bytes()); // timer_id
        payload.extend_from_slice(&0_u64.to_le_bytes()); // due: relative 0
        payload.extend_from_slice(&0_u64.to_le_bytes()); // interval: one-shot
        payload.extend_from_slice(&ARM_RELATIVE.to_le_bytes());
        let resp = send(&cap, ops::TIMER_ARM, 1, &payload);
        assert!(parse(&resp).unwrap().header.is_ok());

        std::thread::sleep(Duration::from_millis(2));

        let mut poll_payload = Vec::new();
        poll_payload.extend_from_slice(&16_u32.to_le_bytes());
        poll_payload.extend_from_slice(&0_u32.to_le_bytes());
        let resp = send(&cap, ops::POLL, 2, &poll_payload);
        let parsed = parse(&resp).unwrap();
        assert!(parsed.header.is_ok());
        let count = u32::from_le_bytes(parsed.payload[8..12].try_into().unwrap());
        assert_eq!(count, 1);

        // Second poll: timer already fired and was one-shot, so no event.
        let resp2 = send(&cap, ops::POLL, 3, &poll_payload);
        let parsed2 = parse(&resp2).unwrap();
        let count2 = u32::from_le_bytes(parsed2.payload[8..12].try_into().unwrap());
        assert_eq!(count2, 0);
    }

    #[test]
    fn watch_then_unwatch_succeeds() {
        let (runtime, cap) = make_loop();
        let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let handle = runtime.handles.alloc_with_poll(
            Arc::new(struct_helper()),
            Arc::new(FdPoll(sock)),
            zingcore_core::hflags::READABLE,
        );

        let mut payload = Vec::new();
        payload.extend_from_slice(&handle.to_le_bytes());
        payload.extend_from_slice(&event::READABLE.to_le_bytes());
        payload.extend_from_slice(&1_u64.to_le_bytes());
        payload.extend_from_slice(&0_u32.to_le_bytes());
        let resp = send(&cap, ops::WATCH, 1, &payload);
        assert!(parse(&resp).unwrap().header.is_ok());

        let unwatch_payload = 1_u64.to_le_bytes();
        let resp = send(&cap, ops::UNWATCH, 2, &unwatch_payload);
        assert!(parse(&resp).unwrap().header.is_ok());
    }

    fn struct_helper() -> impl HandleOps {
        struct Dummy;
        impl HandleOps for Dummy {
            fn read(&self, _buf: &mut [u8]) -> Result<usize, CoreError> {
                Ok(0)
            }
            fn write(&self, b: &[u8]) -> Result<usize, CoreError> {
                Ok(b.len())
            }
            fn end(&self) -> Result<(), CoreError> {
                Ok(())
            }
        }
        Dummy
    }
}
