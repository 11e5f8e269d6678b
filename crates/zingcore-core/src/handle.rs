//! The handle table: small integer ids bound to polymorphic byte streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::CoreError;

/// Capability flags advertised by a live handle.
pub mod hflags {
    /// The handle supports `read`.
    pub const READABLE: u32 = 1;
    /// The handle supports `write`.
    pub const WRITABLE: u32 = 2;
    /// The handle supports `end`.
    pub const ENDABLE: u32 = 4;
}

/// The first id `alloc` may hand out; 0/1/2 are reserved.
pub const FIRST_ID: u32 = 3;

/// The polymorphic operations every handle exposes.
///
/// Implementations use interior mutability; the capability that owns the
/// context is responsible for its own synchronization. The handle table
/// only ever hands out shared references.
pub trait HandleOps: Send + Sync {
    /// Read up to `buf.len()` bytes. Returns the number of bytes read, or
    /// [`CoreError::Again`] if the operation would block.
    fn read(&self, buf: &mut [u8]) -> Result<usize, CoreError>;

    /// Write up to `buf.len()` bytes. Returns the number of bytes accepted.
    fn write(&self, buf: &[u8]) -> Result<usize, CoreError>;

    /// Finalize the handle. Called once, before the slot is released.
    fn end(&self) -> Result<(), CoreError>;

    /// Capability-specific control operation. Defaults to `NOSYS`.
    fn ctl(&self, _req: &[u8], _resp: &mut Vec<u8>) -> Result<usize, CoreError> {
        Err(CoreError::Nosys)
    }
}

/// How a handle participates in `sys/loop` multiplexing.
pub enum Pollable {
    /// An OS file descriptor the loop can multiplex with the host poller.
    Fd(std::os::fd::RawFd),
    /// A computed-readiness handle: a wakeup fd signals "something changed",
    /// and `get_ready` on the owning [`PollOps`] determines the actual mask.
    Computed {
        /// The read end of a self-pipe/event-fd the loop polls for wakeups.
        wakeup_fd: std::os::fd::RawFd,
    },
}

/// The poll-side hook for a pollable handle.
pub trait PollOps: Send + Sync {
    /// How this handle is multiplexed.
    fn pollable(&self) -> Pollable;

    /// For [`Pollable::Computed`] handles: the currently-ready event mask.
    fn get_ready(&self) -> u32 {
        0
    }

    /// For [`Pollable::Computed`] handles: drain the wakeup notification
    /// after the loop has observed it and read `get_ready`.
    fn drain_wakeup(&self) {}
}

struct Slot {
    ops: Arc<dyn HandleOps>,
    poll: Option<Arc<dyn PollOps>>,
    flags: u32,
}

/// Process-scoped table assigning small integer ids to live handles.
///
/// Ids 0/1/2 are reserved and never handed out by [`HandleTable::alloc`];
/// `lookup` refuses them too.
pub struct HandleTable {
    next: AtomicU32,
    slots: RwLock<HashMap<u32, Slot>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    /// Create an empty handle table.
    #[must_use]
    pub fn new() -> Self {
        Self { next: AtomicU32::new(FIRST_ID), slots: RwLock::new(HashMap::new()) }
    }

    fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a handle with no poll hook.
    pub fn alloc(&self, ops: Arc<dyn HandleOps>, flags: u32) -> u32 {
        let id = self.next_id();
        self.slots.write().unwrap_or_else(|e| e.into_inner()).insert(id, Slot { ops, poll: None, flags });
        id
    }

    /// Allocate a handle with a poll hook registered.
    pub fn alloc_with_poll(&self, ops: Arc<dyn HandleOps>, poll: Arc<dyn PollOps>, flags: u32) -> u32 {
        let id = self.next_id();
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Slot { ops, poll: Some(poll), flags });
        id
    }

    /// Look up the ops for a live handle.
    pub fn lookup(&self, id: u32) -> Result<Arc<dyn HandleOps>, CoreError> {
        if id < FIRST_ID {
            return Err(CoreError::Noent(format!("handle {id} is reserved")));
        }
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|slot| slot.ops.clone())
            .ok_or_else(|| CoreError::Noent(format!("no such handle {id}")))
    }

    /// Look up the poll hook for a live handle, if it has one.
    pub fn lookup_poll(&self, id: u32) -> Option<Arc<dyn PollOps>> {
        if id < FIRST_ID {
            return None;
        }
        self.slots.read().unwrap_or_else(|e| e.into_inner()).get(&id).and_then(|slot| slot.poll.clone())
    }

    /// The flag set of a live handle.
    pub fn hflags(&self, id: u32) -> Result<u32, CoreError> {
        if id < FIRST_ID {
            return Err(CoreError::Noent(format!("handle {id} is reserved")));
        }
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|slot| slot.flags)
            .ok_or_else(|| CoreError::Noent(format!("no such handle {id}")))
    }

    /// Release a slot. The caller must already have invoked `ops.end()`.
    pub fn release(&self, id: u32) -> Result<(), CoreError> {
        if id < FIRST_ID {
            return Err(CoreError::Noent(format!("handle {id} is reserved")));
        }
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::Noent(format!("no such handle {id}")))
    }

    /// Every currently-live handle id, for diagnostics and the event loop.
    pub fn live_ids(&self) -> Vec<u32> {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl HandleOps for Noop {
        fn read(&self, _buf: &mut [u8]) -> Result<usize, CoreError> {
            Ok(0)
        }
        fn write(&self, buf: &[u8]) -> Result<usize, CoreError> {
            Ok(buf.len())
        }
        fn end(&self) -> Result<(), CoreError> {
            Ok(())
        }
    }

    #[test]
    fn alloc_never_returns_reserved_ids() {
        let table = HandleTable::new();
        for _ in 0..10 {
            let id = table.alloc(Arc::new(Noop), hflags::READABLE);
            assert!(id >= FIRST_ID);
        }
    }

    #[test]
    fn lookup_refuses_reserved_ids() {
        let table = HandleTable::new();
        for reserved in 0..FIRST_ID {
            assert!(table.lookup(reserved).is_err());
        }
    }

    #[test]
    fn release_then_lookup_fails() {
        let table = HandleTable::new();
        let id = table.alloc(Arc::new(Noop), hflags::READABLE);
        table.release(id).unwrap();
        assert!(table.lookup(id).is_err());
    }

    #[test]
    fn hflags_roundtrip() {
        let table = HandleTable::new();
        let id = table.alloc(Arc::new(Noop), hflags::READABLE | hflags::WRITABLE);
        assert_eq!(table.hflags(id).unwrap(), hflags::READABLE | hflags::WRITABLE);
    }

    #[test]
    fn ids_are_not_reused_while_other_handles_stay_live() {
        let table = HandleTable::new();
        let a = table.alloc(Arc::new(Noop), 0);
        let b = table.alloc(Arc::new(Noop), 0);
        assert_ne!(a, b);
    }
}
