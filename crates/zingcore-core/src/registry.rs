//! The capability registry: named `(kind, name, version)` descriptors and
//! their `open` dispatch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::CoreError;
use crate::runtime::Runtime;

/// Capability descriptor flags.
pub mod cflags {
    /// The capability implements `open`.
    pub const CAN_OPEN: u32 = 1;
    /// Opening or operating on this capability's handles may block the
    /// calling thread (used by capabilities with their own worker threads).
    pub const MAY_BLOCK: u32 = 2;
}

/// An immutable `(kind, name, version, flags, meta)` record.
#[derive(Debug, Clone)]
pub struct CapDescriptor {
    /// Capability family, e.g. `"net"`, `"sys"`, `"file"`.
    pub kind: String,
    /// Capability name within its kind, e.g. `"http"`, `"tcp"`, `"loop"`.
    pub name: String,
    /// Highest protocol version this descriptor answers.
    pub version: u32,
    /// [`cflags`] bitmask.
    pub flags: u32,
    /// Opaque descriptor metadata surfaced by `CAPS_LIST`.
    pub meta: bytes::Bytes,
}

/// A guest's request to open a capability.
pub struct OpenRequest<'a> {
    /// Capability kind to look up.
    pub kind: &'a str,
    /// Capability name to look up.
    pub name: &'a str,
    /// Requested protocol version; must be `<=` the registered version.
    pub version: u32,
    /// Capability-defined open parameters.
    pub params: &'a [u8],
}

/// The function a capability registers to implement `open`.
///
/// Takes `Arc<Runtime>` (not a bare reference) so capabilities that run a
/// background thread (HTTP listener, File AIO workers) can retain access to
/// the handle table and registry for their whole lifetime, not just for the
/// duration of the `open` call.
pub type OpenFn = dyn Fn(&Arc<Runtime>, &OpenRequest<'_>) -> Result<u32, CoreError> + Send + Sync;

struct Entry {
    descriptor: CapDescriptor,
    open: Arc<OpenFn>,
}

/// Process-global table of registered capabilities.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<(String, String), Entry>>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability. Fails if `(kind, name)` is already registered.
    pub fn register(
        &self,
        descriptor: CapDescriptor,
        open: Arc<OpenFn>,
    ) -> Result<(), CoreError> {
        let key = (descriptor.kind.clone(), descriptor.name.clone());
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&key) {
            return Err(CoreError::Invalid(format!(
                "capability {}/{} already registered",
                key.0, key.1
            )));
        }
        entries.insert(key, Entry { descriptor, open });
        Ok(())
    }

    /// Number of registered capabilities.
    pub fn count(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Every registered descriptor, in no particular order.
    pub fn list(&self) -> Vec<CapDescriptor> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Dispatch an open request to the matching capability.
    ///
    /// Version negotiation is minor-compatible: a registered version `N`
    /// answers any request with `version <= N`.
    pub fn open(&self, runtime: &Arc<Runtime>, req: &OpenRequest<'_>) -> Result<u32, CoreError> {
        let key = (req.kind.to_string(), req.name.to_string());
        let (descriptor, open) = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            let entry = entries
                .get(&key)
                .ok_or_else(|| CoreError::Noent(format!("capability {}/{} not found", key.0, key.1)))?;
            (entry.descriptor.clone(), entry.open.clone())
        };
        if req.version > descriptor.version {
            return Err(CoreError::Invalid(format!(
                "capability {}/{} does not support version {}",
                key.0, key.1, req.version
            )));
        }
        open(runtime, req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn noop_open(_rt: &Arc<Runtime>, _req: &OpenRequest<'_>) -> Result<u32, CoreError> {
        Ok(3)
    }

    fn descriptor(kind: &str, name: &str, version: u32) -> CapDescriptor {
        CapDescriptor {
            kind: kind.to_string(),
            name: name.to_string(),
            version,
            flags: cflags::CAN_OPEN,
            meta: bytes::Bytes::new(),
        }
    }

    #[test]
    fn register_then_list_includes_it() {
        let registry = CapabilityRegistry::new();
        registry.register(descriptor("sys", "loop", 1), Arc::new(noop_open)).unwrap();
        assert_eq!(registry.count(), 1);
        let list = registry.list();
        assert_eq!(list[0].kind, "sys");
        assert_eq!(list[0].name, "loop");
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = CapabilityRegistry::new();
        registry.register(descriptor("sys", "loop", 1), Arc::new(noop_open)).unwrap();
        assert!(registry.register(descriptor("sys", "loop", 1), Arc::new(noop_open)).is_err());
    }

    #[test]
    fn open_rejects_newer_version_than_registered() {
        let registry = CapabilityRegistry::new();
        registry.register(descriptor("sys", "loop", 1), Arc::new(noop_open)).unwrap();
        let runtime = Arc::new(Runtime::new_native());
        let req = OpenRequest { kind: "sys", name: "loop", version: 2, params: &[] };
        assert!(registry.open(&runtime, &req).is_err());
    }

    #[test]
    fn open_accepts_older_or_equal_version() {
        let registry = CapabilityRegistry::new();
        registry.register(descriptor("sys", "loop", 2), Arc::new(noop_open)).unwrap();
        let runtime = Arc::new(Runtime::new_native());
        let req = OpenRequest { kind: "sys", name: "loop", version: 1, params: &[] };
        assert_eq!(registry.open(&runtime, &req).unwrap(), 3);
    }

    #[test]
    fn open_unregistered_capability_fails() {
        let registry = CapabilityRegistry::new();
        let runtime = Arc::new(Runtime::new_native());
        let req = OpenRequest { kind: "net", name: "tcp", version: 1, params: &[] };
        assert!(registry.open(&runtime, &req).is_err());
    }
}
