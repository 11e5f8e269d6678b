//! Errno-to-`CoreError` mapping shared by the stream and listener handles.

use std::io;

use zingcore_core::CoreError;

/// Map an I/O error observed on a TCP socket onto the core error model.
///
/// Mirrors the reference mapping: would-block is `EAgain`, permission
/// failures are `EDenied`, and anything unrecognized falls back to `EIo`.
pub fn map_io_error(err: &io::Error) -> CoreError {
    match err.kind() {
        io::ErrorKind::WouldBlock => CoreError::Again,
        io::ErrorKind::PermissionDenied => CoreError::Denied(err.to_string()),
        io::ErrorKind::NotFound => CoreError::Noent(err.to_string()),
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => CoreError::Invalid(err.to_string()),
        io::ErrorKind::AddrInUse => CoreError::Again,
        io::ErrorKind::AddrNotAvailable => CoreError::Invalid(err.to_string()),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => CoreError::Closed,
        _ => CoreError::Io(err.to_string()),
    }
}
