//! Errors for the event loop capability.

use thiserror::Error;
use zingcore_core::CoreError;

/// Failures specific to `sys/loop` request handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoopError {
    /// Delegated to the core error model.
    #[error(transparent)]
    Core(#[from] CoreError),
    /// A watch/timer id was zero, which is reserved as "unset".
    #[error("watch/timer ids must be non-zero")]
    ZeroId,
    /// The static watch or timer table is full.
    #[error("loop capacity exceeded")]
    Full,
    /// The watched handle has no poll hook and cannot be multiplexed.
    #[error("handle is not pollable")]
    NotPollable,
    /// A request payload had the wrong length for its op.
    #[error("malformed request payload")]
    MalformedPayload,
}

impl LoopError {
    /// A stable short trace identifier for a ZCL1 error frame.
    #[must_use]
    pub fn trace(&self) -> &'static str {
        match self {
            Self::Core(e) => e.trace(),
            Self::ZeroId => "t_loop_invalid",
            Self::Full => "t_loop_bounds",
            Self::NotPollable => "t_loop_invalid",
            Self::MalformedPayload => "t_loop_invalid",
        }
    }
}
