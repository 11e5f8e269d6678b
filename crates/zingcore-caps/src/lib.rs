//! Five small capabilities that round out the guest-facing surface:
//! `file/aio`, `event/bus`, `async/default`, `sys/info` and `proc/env`.
//!
//! Each submodule owns its op codes, wire layout and a `descriptor()`/`open()`
//! pair, the same shape every other `zingcore-*` capability crate exposes, so
//! a host wires these in with [`zingcore_core::registry::CapabilityRegistry::register`]
//! exactly like `net/tcp` or `net/http`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod async_default;
pub mod error;
pub mod event_bus;
pub mod file_aio;
pub mod limits;
pub mod proc_env;
pub mod sys_info;

pub use error::CapsError;
pub use limits::Limits;
