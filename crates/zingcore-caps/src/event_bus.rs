//! `event/bus`: a per-process publish/subscribe topic table.
//!
//! Every `open` call returns an independent control-channel handle, but all
//! handles share one process-global topic table (installed once behind a
//! [`OnceLock`], mirroring [`zingcore_core::runtime::install_global`]'s
//! write-once-at-startup idiom). `PUBLISH` on any handle can deliver to a
//! subscriber registered from any other handle.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::{Buf, BufMut, BytesMut};
use mio::unix::pipe;
use zingcore_core::handle::Pollable;
use zingcore_core::registry::{cflags, CapDescriptor, OpenRequest};
use zingcore_core::{hflags, CoreError, HandleOps, PollOps, Runtime};

use crate::error::CapsError;
use crate::limits::Limits;

/// `event/bus` op codes.
pub mod ops {
    /// `SUBSCRIBE(topic, flags=0) -> sub_id`.
    pub const SUBSCRIBE: u16 = 1;
    /// `UNSUBSCRIBE(sub_id)`.
    pub const UNSUBSCRIBE: u16 = 2;
    /// `PUBLISH(topic, payload)`.
    pub const PUBLISH: u16 = 3;
    /// Server-pushed: a published event matching a live subscription.
    pub const EV_EVENT: u16 = 100;
}

/// A pending subscriber's slot under one topic. `cap` is a [`Weak`] ref so a
/// dropped handle's stale subscription is pruned lazily on the next publish
/// or unsubscribe, rather than requiring every handle to explicitly clean up
/// the global table on `end`.
struct Subscriber {
    sub_id: u32,
    cap: Weak<EventBusCap>,
}

#[derive(Default)]
struct GlobalBus {
    next_sub_id: AtomicU32,
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    by_id: Mutex<HashMap<u32, String>>,
}

impl GlobalBus {
    fn subscribe(&self, topic: String, cap: Weak<EventBusCap>) -> u32 {
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).entry(topic.clone()).or_default().push(Subscriber {
            sub_id,
            cap,
        });
        self.by_id.lock().unwrap_or_else(|e| e.into_inner()).insert(sub_id, topic);
        sub_id
    }

    fn unsubscribe(&self, sub_id: u32) {
        let topic = self.by_id.lock().unwrap_or_else(|e| e.into_inner()).remove(&sub_id);
        if let Some(topic) = topic {
            if let Some(subs) = self.topics.lock().unwrap_or_else(|e| e.into_inner()).get_mut(&topic) {
                subs.retain(|s| s.sub_id != sub_id);
            }
        }
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> u32 {
        let mut delivered = 0;
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain_mut(|sub| {
                let Some(cap) = sub.cap.upgrade() else { return false };
                if cap.try_deliver(sub.sub_id, topic, payload) {
                    delivered += 1;
                }
                true
            });
        }
        delivered
    }
}

static BUS: OnceLock<Arc<GlobalBus>> = OnceLock::new();

fn bus() -> Arc<GlobalBus> {
    BUS.get_or_init(|| Arc::new(GlobalBus::default())).clone()
}

/// Upper bound on bytes queued for one subscriber before `PUBLISH` starts
/// skipping it rather than growing the queue without bound.
const OUTPUT_QUEUE_CAP: usize = 1 << 20;

struct State {
    out: VecDeque<u8>,
    subscriptions: Vec<u32>,
}

/// The `event/bus` capability's control-channel handle.
pub struct EventBusCap {
    limits: Limits,
    state: Mutex<State>,
    notify_w: Mutex<pipe::Sender>,
    notify_r: Mutex<pipe::Receiver>,
    /// Back-reference handed to the global bus on `SUBSCRIBE` so it can push
    /// events onto this handle without holding a strong ref that would keep
    /// an `end`-ed handle alive forever.
    self_weak: Weak<EventBusCap>,
}

impl EventBusCap {
    fn push_frame(&self, frame: &[u8]) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.out.extend(frame.iter().copied());
        drop(state);
        let mut w = self.notify_w.lock().unwrap_or_else(|e| e.into_inner());
        let _ = w.write(&[1]);
    }

    fn try_deliver(&self, sub_id: u32, topic: &str, payload: &[u8]) -> bool {
        let mut buf = BytesMut::new();
        buf.put_u32_le(sub_id);
        buf.put_u32_le(topic.len() as u32);
        buf.put_slice(topic.as_bytes());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(payload);

        let frame_len = zingcore_wire::HEADER_LEN + buf.len();
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.out.len() + frame_len > OUTPUT_QUEUE_CAP {
                return false;
            }
        }
        let mut frame = BytesMut::zeroed(frame_len);
        let n = zingcore_wire::write_ok(&mut frame, ops::EV_EVENT, 0, &buf).unwrap_or(0);
        frame.truncate(n);
        self.push_frame(&frame);
        true
    }

    fn dispatch(&self, op: u16, rid: u32, payload: &[u8]) -> Result<BytesMut, CapsError> {
        let body = match op {
            ops::SUBSCRIBE => self.op_subscribe(payload)?,
            ops::UNSUBSCRIBE => self.op_unsubscribe(payload)?,
            ops::PUBLISH => self.op_publish(payload)?,
            _ => return Err(CapsError::Core(CoreError::Nosys)),
        };
        let mut frame = BytesMut::zeroed(zingcore_wire::HEADER_LEN + body.len());
        let n = zingcore_wire::write_ok(&mut frame, op, rid, &body)
            .map_err(|e| CapsError::Core(CoreError::Bounds(e.to_string())))?;
        frame.truncate(n);
        Ok(frame)
    }

    fn op_subscribe(&self, payload: &[u8]) -> Result<BytesMut, CapsError> {
        let mut p = payload;
        let topic = read_topic(&mut p, self.limits.max_topic_bytes)?;
        if p.len() < 4 {
            return Err(CapsError::MalformedPayload);
        }
        let _flags = p.get_u32_le();
        if !p.is_empty() {
            return Err(CapsError::MalformedPayload);
        }
        let sub_id = bus().subscribe(topic, self.self_weak.clone());
        self.state.lock().unwrap_or_else(|e| e.into_inner()).subscriptions.push(sub_id);
        let mut out = BytesMut::with_capacity(4);
        out.put_u32_le(sub_id);
        Ok(out)
    }

    fn op_unsubscribe(&self, payload: &[u8]) -> Result<BytesMut, CapsError> {
        if payload.len() != 4 {
            return Err(CapsError::MalformedPayload);
        }
        let sub_id = (&payload[..]).get_u32_le();
        if sub_id == 0 {
            return Err(CapsError::ZeroId);
        }
        bus().unsubscribe(sub_id);
        self.state.lock().unwrap_or_else(|e| e.into_inner()).subscriptions.retain(|id| *id != sub_id);
        Ok(BytesMut::new())
    }

    fn op_publish(&self, payload: &[u8]) -> Result<BytesMut, CapsError> {
        let mut p = payload;
        let topic = read_topic(&mut p, self.limits.max_topic_bytes)?;
        if p.len() < 4 {
            return Err(CapsError::MalformedPayload);
        }
        let data_len = p.get_u32_le() as usize;
        if data_len > self.limits.max_event_payload_bytes || p.len() < data_len {
            return Err(CapsError::EventTooLarge);
        }
        let data = &p[..data_len];
        let delivered = bus().publish(&topic, data);
        let mut out = BytesMut::with_capacity(4);
        out.put_u32_le(delivered);
        Ok(out)
    }
}

fn read_topic(p: &mut &[u8], max_topic_bytes: usize) -> Result<String, CapsError> {
    if p.len() < 4 {
        return Err(CapsError::MalformedPayload);
    }
    let topic_len = p.get_u32_le() as usize;
    if topic_len > max_topic_bytes || p.len() < topic_len {
        return Err(CapsError::EventTooLarge);
    }
    let topic_bytes = &p[..topic_len];
    let topic = std::str::from_utf8(topic_bytes).map_err(|_| CapsError::MalformedPayload)?.to_string();
    p.advance(topic_len);
    Ok(topic)
}

impl HandleOps for EventBusCap {
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
        self.push_frame(&response);
        Ok(consumed)
    }

    fn end(&self) -> Result<(), CoreError> {
        let ids = std::mem::take(&mut self.state.lock().unwrap_or_else(|e| e.into_inner()).subscriptions);
        let bus = bus();
        for id in ids {
            bus.unsubscribe(id);
        }
        Ok(())
    }
}

impl PollOps for EventBusCap {
    fn pollable(&self) -> Pollable {
        let wakeup_fd = self.notify_r.lock().unwrap_or_else(|e| e.into_inner()).as_raw_fd();
        Pollable::Computed { wakeup_fd }
    }

    fn get_ready(&self) -> u32 {
        let ready = !self.state.lock().unwrap_or_else(|e| e.into_inner()).out.is_empty();
        if ready {
            zingcore_wire::event::READABLE
        } else {
            0
        }
    }

    fn drain_wakeup(&self) {
        let mut r = self.notify_r.lock().unwrap_or_else(|e| e.into_inner());
        let mut scratch = [0_u8; 64];
        while matches!((&mut *r).read(&mut scratch), Ok(n) if n > 0) {}
    }
}

/// The `(kind="event", name="bus")` descriptor.
#[must_use]
pub fn descriptor() -> CapDescriptor {
    CapDescriptor {
        kind: "event".into(),
        name: "bus".into(),
        version: 1,
        flags: cflags::CAN_OPEN,
        meta: bytes::Bytes::new(),
    }
}

/// Open an `event/bus` handle onto the process-global topic table.
pub fn open(runtime: &Arc<Runtime>, _req: &OpenRequest<'_>) -> Result<u32, CoreError> {
    let (sender, receiver) = pipe::new().map_err(|e| CoreError::Io(e.to_string()))?;
    sender.set_nonblocking(true).ok();
    receiver.set_nonblocking(true).ok();

    let cap = Arc::new_cyclic(|self_weak| EventBusCap {
        limits: Limits::from_env(),
        state: Mutex::new(State { out: VecDeque::new(), subscriptions: Vec::new() }),
        notify_w: Mutex::new(sender),
        notify_r: Mutex::new(receiver),
        self_weak: self_weak.clone(),
    });
    let id = runtime.handles.alloc_with_poll(cap.clone(), cap, hflags::READABLE | hflags::WRITABLE | hflags::ENDABLE);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use zingcore_wire::{parse, write_ok};

    use super::*;

    fn make_cap() -> Arc<EventBusCap> {
        let (sender, receiver) = pipe::new().unwrap();
        Arc::new_cyclic(|self_weak| EventBusCap {
            limits: Limits::from_env(),
            state: Mutex::new(State { out: VecDeque::new(), subscriptions: Vec::new() }),
            notify_w: Mutex::new(sender),
            notify_r: Mutex::new(receiver),
            self_weak: self_weak.clone(),
        })
    }

    #[test]
    fn subscribe_then_publish_delivers_event() {
        let cap = make_cap();
        let mut sub_payload = BytesMut::new();
        sub_payload.put_u32_le(5);
        sub_payload.put_slice(b"topic");
        sub_payload.put_u32_le(0);
        let resp = cap.dispatch(ops::SUBSCRIBE, 1, &sub_payload).unwrap();
        let parsed = parse(&resp).unwrap();
        assert!(parsed.header.is_ok());
        let sub_id = (&parsed.payload[..]).get_u32_le();
        assert_ne!(sub_id, 0);

        let mut pub_payload = BytesMut::new();
        pub_payload.put_u32_le(5);
        pub_payload.put_slice(b"topic");
        pub_payload.put_u32_le(5);
        pub_payload.put_slice(b"hello");
        let resp = cap.dispatch(ops::PUBLISH, 2, &pub_payload).unwrap();
        let parsed = parse(&resp).unwrap();
        let delivered = (&parsed.payload[..]).get_u32_le();
        assert_eq!(delivered, 1);

        let mut out = [0_u8; 256];
        let n = cap.read(&mut out).unwrap();
        let event_frame = parse(&out[..n]).unwrap();
        assert_eq!(event_frame.header.op(), ops::EV_EVENT);
    }

    #[test]
    fn publish_to_unknown_topic_delivers_to_nobody() {
        let cap = make_cap();
        let mut pub_payload = BytesMut::new();
        pub_payload.put_u32_le(7);
        pub_payload.put_slice(b"nowhere");
        pub_payload.put_u32_le(0);
        let resp = cap.dispatch(ops::PUBLISH, 1, &pub_payload).unwrap();
        let parsed = parse(&resp).unwrap();
        assert_eq!((&parsed.payload[..]).get_u32_le(), 0);
    }

    #[test]
    fn unsubscribe_then_publish_delivers_nothing() {
        let cap = make_cap();
        let mut sub_payload = BytesMut::new();
        sub_payload.put_u32_le(1);
        sub_payload.put_slice(b"t");
        sub_payload.put_u32_le(0);
        let resp = cap.dispatch(ops::SUBSCRIBE, 1, &sub_payload).unwrap();
        let sub_id = (&parse(&resp).unwrap().payload[..]).get_u32_le();

        let unsub_payload = sub_id.to_le_bytes();
        cap.dispatch(ops::UNSUBSCRIBE, 2, &unsub_payload).unwrap();

        let mut pub_payload = BytesMut::new();
        pub_payload.put_u32_le(1);
        pub_payload.put_slice(b"t");
        pub_payload.put_u32_le(0);
        let resp = cap.dispatch(ops::PUBLISH, 3, &pub_payload).unwrap();
        assert_eq!((&parse(&resp).unwrap().payload[..]).get_u32_le(), 0);
    }

    #[test]
    fn descriptor_advertises_event_bus() {
        let d = descriptor();
        assert_eq!(d.kind, "event");
        assert_eq!(d.name, "bus");
    }

    #[test]
    fn open_then_dispatch_through_handle_table() {
        let runtime = Arc::new(Runtime::new_native());
        let id = open(&runtime, &OpenRequest { kind: "event", name: "bus", version: 1, params: &[] }).unwrap();
        let handle_ops = runtime.handles.lookup(id).unwrap();

        let mut payload = BytesMut::new();
        payload.put_u32_le(1);
        payload.put_slice(b"x");
        payload.put_u32_le(0);
        let mut req = vec![0_u8; zingcore_wire::HEADER_LEN + payload.len()];
        let n = write_ok(&mut req, ops::SUBSCRIBE, 1, &payload).unwrap();
        handle_ops.write(&req[..n]).unwrap();

        let mut out = [0_u8; 256];
        let read_n = handle_ops.read(&mut out).unwrap();
        assert!(parse(&out[..read_n]).unwrap().header.is_ok());
    }
}
