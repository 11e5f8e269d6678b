//! Errors shared by the File AIO, event bus, async/default, sys/info and
//! proc/env capabilities.

use thiserror::Error;
use zingcore_core::CoreError;

/// Failures specific to this crate's capability dispatch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapsError {
    /// Delegated to the core error model.
    #[error(transparent)]
    Core(#[from] CoreError),
    /// A request payload had the wrong length or shape for its op.
    #[error("malformed request payload")]
    MalformedPayload,
    /// A sub/future/request id was zero, which is reserved as "unset".
    #[error("ids must be non-zero")]
    ZeroId,
    /// `file/aio`'s bounded submission queue is at capacity.
    #[error("queue full")]
    QueueFull,
    /// `async/default` `INVOKE` named a selector that isn't registered.
    #[error("unknown selector")]
    UnknownSelector,
    /// `async/default` `INVOKE` reused a `future_id` already in flight.
    #[error("duplicate future id")]
    DuplicateFuture,
    /// An `event/bus` topic or payload exceeded its size cap.
    #[error("topic or payload exceeds the maximum event size")]
    EventTooLarge,
}

impl CapsError {
    /// A stable short trace identifier for a ZCL1 error frame.
    ///
    /// `QueueFull`'s trace is the literal `"file.aio"`, not the
    /// `t_caps_*`-prefixed form used elsewhere in this crate, matching the
    /// reference encoder's error frame for a full submission queue exactly.
    #[must_use]
    pub fn trace(&self) -> &'static str {
        match self {
            Self::Core(e) => e.trace(),
            Self::MalformedPayload | Self::ZeroId => "t_caps_invalid",
            Self::QueueFull => "file.aio",
            Self::UnknownSelector => "t_async_noent",
            Self::DuplicateFuture => "t_async_dup_future",
            Self::EventTooLarge => "t_bus_limit",
        }
    }
}
