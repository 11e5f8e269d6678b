//! Builds a real [`Runtime`] with every capability crate registered, for
//! integration tests that drive actual threads and sockets rather than a
//! simulated clock.

use std::sync::Arc;

use tracing::debug;
use zingcore_core::registry::CapDescriptor;
use zingcore_core::{CoreError, Runtime};

/// Register `sys/loop`, `net/tcp`, `net/http` and the five `zingcore-caps`
/// capabilities onto `runtime`.
pub fn register_all(runtime: &Arc<Runtime>) -> Result<(), CoreError> {
    runtime.registry.register(zingcore_loop::descriptor(), Arc::new(zingcore_loop::open))?;
    runtime.registry.register(zingcore_net::descriptor(), Arc::new(zingcore_net::open))?;
    runtime.registry.register(zingcore_http::descriptor(), Arc::new(zingcore_http::open))?;
    runtime.registry.register(zingcore_caps::file_aio::descriptor(), Arc::new(zingcore_caps::file_aio::open))?;
    runtime.registry.register(zingcore_caps::event_bus::descriptor(), Arc::new(zingcore_caps::event_bus::open))?;
    runtime
        .registry
        .register(zingcore_caps::async_default::descriptor(), Arc::new(zingcore_caps::async_default::open))?;
    runtime.registry.register(zingcore_caps::sys_info::descriptor(), Arc::new(zingcore_caps::sys_info::open))?;
    runtime.registry.register(zingcore_caps::proc_env::descriptor(), Arc::new(zingcore_caps::proc_env::open))?;
    debug!(count = runtime.registry.count(), "registered full capability surface");
    Ok(())
}

/// A native runtime with the full capability surface registered, ready for a
/// guest driver to open handles against.
pub fn build_runtime() -> Result<Arc<Runtime>, CoreError> {
    let runtime = Arc::new(Runtime::new_native());
    register_all(&runtime)?;
    Ok(runtime)
}

/// Every descriptor `build_runtime` is expected to register, for completeness
/// assertions in tests (`caps_list` invariant).
#[must_use]
pub fn expected_descriptors() -> Vec<(&'static str, &'static str)> {
    vec![
        ("sys", "loop"),
        ("net", "tcp"),
        ("net", "http"),
        ("file", "aio"),
        ("event", "bus"),
        ("async", "default"),
        ("sys", "info"),
        ("proc", "env"),
    ]
}

/// True if `descriptors` contains exactly one entry per [`expected_descriptors`],
/// ignoring order.
#[must_use]
pub fn covers_expected(descriptors: &[CapDescriptor]) -> bool {
    expected_descriptors().iter().all(|(kind, name)| descriptors.iter().any(|d| d.kind == *kind && d.name == *name))
}
