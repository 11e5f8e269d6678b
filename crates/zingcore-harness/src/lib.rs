//! Simulation and loopback scaffolding shared by the integration tests under
//! `tests/`.
//!
//! [`sim_env::SimEnv`] is a deterministic [`zingcore_core::Environment`] for
//! anything that wants a repeatable clock or RNG stream. The event loop and
//! the network capabilities don't consume `Environment` themselves (they run
//! on real timers and real sockets), so the rest of this crate is a thin
//! helper, [`loopback::build_runtime`], that wires a real [`zingcore_core::Runtime`]
//! up with every capability crate for tests that drive it end to end.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod loopback;
pub mod sim_env;

pub use loopback::{build_runtime, covers_expected, expected_descriptors, register_all};
pub use sim_env::{SimEnv, SimInstant};
