//! Handle table, capability registry, runtime binding and syscall dispatch —
//! the concurrency and I/O substrate every zingcore capability builds on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod env;
pub mod error;
pub mod handle;
pub mod registry;
pub mod runtime;
pub mod syscall;

pub use env::{Environment, SystemEnv};
pub use error::{CoreError, ErrorCode};
pub use handle::{hflags, HandleOps, HandleTable, Pollable, PollOps};
pub use registry::{cflags, CapDescriptor, CapabilityRegistry, OpenFn, OpenRequest};
pub use runtime::{HostOverrides, MemRange, MemoryMapper, NativeMemoryMapper, Runtime};
