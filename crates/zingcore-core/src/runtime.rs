//! Process-global runtime binding: host override slots and the guest-memory
//! mapper.

use std::ops::Range;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::CoreError;
use crate::handle::HandleTable;
use crate::registry::CapabilityRegistry;

/// A validated byte range into guest-addressable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRange {
    /// Offset into the guest memory region.
    pub ptr: u64,
    /// Length in bytes.
    pub len: u32,
}

/// Maps guest pointer/length pairs onto real byte slices.
///
/// Every capability that touches guest-supplied buffers goes through this
/// interface rather than treating a guest-provided integer as a raw Rust
/// pointer; the `native` mapper below is the identity map used when the
/// guest and host share one address space.
pub trait MemoryMapper: Send + Sync {
    /// Validate and return a read-only view of `range`.
    fn map_ro(&self, range: MemRange) -> Result<Vec<u8>, CoreError>;

    /// Validate `range` and write `data` into the guest's memory there.
    fn map_rw(&self, range: MemRange, data: &[u8]) -> Result<(), CoreError>;

    /// Size of the backing guest memory region, in bytes.
    fn len(&self) -> usize;

    /// Whether the backing region is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The native memory mapper: guest and host share one linear buffer, so
/// `map_ro`/`map_rw` are plain bounds-checked slices into it.
pub struct NativeMemoryMapper {
    region: RwLock<Vec<u8>>,
}

impl NativeMemoryMapper {
    /// Create a mapper over a freshly allocated region of `size` zeroed bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self { region: RwLock::new(vec![0_u8; size]) }
    }

    fn validate(&self, range: MemRange, region_len: usize) -> Result<Range<usize>, CoreError> {
        let start = usize::try_from(range.ptr).map_err(|_| CoreError::Bounds("ptr overflow".into()))?;
        let len = range.len as usize;
        let end = start.checked_add(len).ok_or_else(|| CoreError::Bounds("range overflow".into()))?;
        if end > region_len {
            return Err(CoreError::Bounds(format!("range {start}..{end} exceeds region of {region_len}")));
        }
        Ok(start..end)
    }
}

impl MemoryMapper for NativeMemoryMapper {
    fn map_ro(&self, range: MemRange) -> Result<Vec<u8>, CoreError> {
        let region = self.region.read().unwrap_or_else(|e| e.into_inner());
        let bounds = self.validate(range, region.len())?;
        Ok(region[bounds].to_vec())
    }

    fn map_rw(&self, range: MemRange, data: &[u8]) -> Result<(), CoreError> {
        let mut region = self.region.write().unwrap_or_else(|e| e.into_inner());
        let bounds = self.validate(range, region.len())?;
        if data.len() != bounds.len() {
            return Err(CoreError::Invalid("data length does not match range".into()));
        }
        region[bounds].copy_from_slice(data);
        Ok(())
    }

    fn len(&self) -> usize {
        self.region.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Optional host overrides for the core syscall entry points (§4.5).
///
/// Any slot left `None` falls through to the handle's own ops (for
/// `read`/`write`/`end`) or to `NOSYS` (for `alloc`/`free`, which have no
/// handle-level fallback).
#[derive(Default, Clone)]
pub struct HostOverrides {
    /// Override for `abi_version()`.
    pub abi_version: Option<Arc<dyn Fn() -> u32 + Send + Sync>>,
    /// Override for `read(h, dst)`, bypassing the handle's own ops.
    pub read: Option<Arc<dyn Fn(u32, &mut [u8]) -> Result<usize, CoreError> + Send + Sync>>,
    /// Override for `write(h, src)`, bypassing the handle's own ops.
    pub write: Option<Arc<dyn Fn(u32, &[u8]) -> Result<usize, CoreError> + Send + Sync>>,
    /// Override for `end(h)`, bypassing the handle's own ops.
    pub end: Option<Arc<dyn Fn(u32) -> Result<(), CoreError> + Send + Sync>>,
    /// Override for `alloc(size)`.
    pub alloc: Option<Arc<dyn Fn(u32) -> Result<u64, CoreError> + Send + Sync>>,
    /// Override for `free(ptr)`.
    pub free: Option<Arc<dyn Fn(u64) -> Result<(), CoreError> + Send + Sync>>,
    /// Override for `telemetry(topic, msg)`.
    pub telemetry: Option<Arc<dyn Fn(&str, &[u8]) + Send + Sync>>,
}

/// Process-global runtime state: handle table, capability registry, the
/// guest-memory mapper, optional host overrides, and the argv/env snapshot.
///
/// Constructed once at startup and shared behind an `Arc`; the setters for
/// `mem` / `host` are meant to run before any capability is opened and are
/// not internally synchronized against concurrent readers (matching the
/// "write-once-at-startup" contract).
pub struct Runtime {
    /// The process-global handle table.
    pub handles: HandleTable,
    /// The process-global capability registry.
    pub registry: CapabilityRegistry,
    mem: Arc<dyn MemoryMapper>,
    host: RwLock<HostOverrides>,
    argv: Vec<String>,
    env: Vec<(String, String)>,
}

impl Runtime {
    /// Construct a runtime over the given guest-memory mapper.
    #[must_use]
    pub fn new(mem: Arc<dyn MemoryMapper>, argv: Vec<String>, env: Vec<(String, String)>) -> Self {
        Self {
            handles: HandleTable::new(),
            registry: CapabilityRegistry::new(),
            mem,
            host: RwLock::new(HostOverrides::default()),
            argv,
            env,
        }
    }

    /// Construct a runtime with the native memory mapper over a 1 MiB region
    /// and the real process argv/env snapshotted at call time.
    #[must_use]
    pub fn new_native() -> Self {
        let argv = std::env::args().collect();
        let env = std::env::vars().collect();
        Self::new(Arc::new(NativeMemoryMapper::new(1 << 20)), argv, env)
    }

    /// The installed guest-memory mapper.
    #[must_use]
    pub fn mem(&self) -> &Arc<dyn MemoryMapper> {
        &self.mem
    }

    /// Install host overrides. Intended to be called once, at startup.
    pub fn set_host_overrides(&self, overrides: HostOverrides) {
        *self.host.write().unwrap_or_else(|e| e.into_inner()) = overrides;
    }

    /// The currently installed host overrides.
    #[must_use]
    pub fn host_overrides(&self) -> HostOverrides {
        self.host.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The argv snapshot captured at startup.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// The env snapshot captured at startup.
    #[must_use]
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }
}

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

/// Install the process-global runtime. Must be called exactly once, before
/// any capability is opened; later calls are ignored (matching the
/// write-once-at-startup contract for runtime slots).
pub fn install_global(runtime: Arc<Runtime>) {
    let _ = GLOBAL.set(runtime);
}

/// The process-global runtime, if installed.
#[must_use]
pub fn global() -> Option<Arc<Runtime>> {
    GLOBAL.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_mapper_round_trips_in_bounds() {
        let mapper = NativeMemoryMapper::new(64);
        mapper.map_rw(MemRange { ptr: 0, len: 5 }, b"hello").unwrap();
        assert_eq!(mapper.map_ro(MemRange { ptr: 0, len: 5 }).unwrap(), b"hello");
    }

    #[test]
    fn native_mapper_rejects_out_of_bounds() {
        let mapper = NativeMemoryMapper::new(8);
        assert!(mapper.map_ro(MemRange { ptr: 4, len: 8 }).is_err());
    }
}
