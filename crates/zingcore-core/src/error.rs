//! The abstract `E_*` syscall error codes and the core crate's error type.

use thiserror::Error;

/// The abstract syscall error codes from the external interface table.
///
/// Syscalls return these as negative integers; ZCL1 capability ops map their
/// own [`CoreError`] (or a capability-specific error enum) onto one of these
/// before writing a status=0 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// No error.
    Ok = 0,
    /// Operation would block; retry later.
    EAgain = -1,
    /// A length or offset was out of bounds.
    EBounds = -2,
    /// Malformed input.
    EInvalid = -3,
    /// No such syscall/operation implemented.
    ENosys = -4,
    /// Underlying I/O failure.
    EIo = -5,
    /// Denied by policy (allowlist, capability flags).
    EDenied = -6,
    /// No such entity (handle, topic, selector, file).
    ENoent = -7,
    /// Out of memory / resource exhausted.
    EOom = -8,
    /// The handle or connection is closed.
    EClosed = -9,
    /// Internal invariant violation; the affected handle is closed.
    EInternal = -10,
}

impl ErrorCode {
    /// The negative integer a syscall returns for this code.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Errors produced by the handle table, capability registry, runtime binding
/// and syscall dispatch layers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Operation would block.
    #[error("would block")]
    Again,
    /// A guest-supplied length/offset/pointer range was out of bounds.
    #[error("out of bounds: {0}")]
    Bounds(String),
    /// Malformed request.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// No implementation for this operation.
    #[error("not implemented")]
    Nosys,
    /// I/O failure.
    #[error("io error: {0}")]
    Io(String),
    /// Denied by policy.
    #[error("denied: {0}")]
    Denied(String),
    /// No such entity.
    #[error("not found: {0}")]
    Noent(String),
    /// Resource exhausted.
    #[error("out of memory/resources: {0}")]
    Oom(String),
    /// Handle already closed.
    #[error("closed")]
    Closed,
    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Map this error onto its abstract syscall error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Again => ErrorCode::EAgain,
            Self::Bounds(_) => ErrorCode::EBounds,
            Self::Invalid(_) => ErrorCode::EInvalid,
            Self::Nosys => ErrorCode::ENosys,
            Self::Io(_) => ErrorCode::EIo,
            Self::Denied(_) => ErrorCode::EDenied,
            Self::Noent(_) => ErrorCode::ENoent,
            Self::Oom(_) => ErrorCode::EOom,
            Self::Closed => ErrorCode::EClosed,
            Self::Internal(_) => ErrorCode::EInternal,
        }
    }

    /// A stable short trace identifier suitable for a ZCL1 error frame.
    #[must_use]
    pub fn trace(&self) -> &'static str {
        match self {
            Self::Again => "t_core_again",
            Self::Bounds(_) => "t_core_bounds",
            Self::Invalid(_) => "t_core_invalid",
            Self::Nosys => "t_core_nosys",
            Self::Io(_) => "t_core_io",
            Self::Denied(_) => "t_core_denied",
            Self::Noent(_) => "t_core_noent",
            Self::Oom(_) => "t_core_oom",
            Self::Closed => "t_core_closed",
            Self::Internal(_) => "t_core_internal",
        }
    }
}
