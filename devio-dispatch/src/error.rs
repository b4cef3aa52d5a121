use std::io;

/// Error kinds surfaced by the dispatcher and the device backends.
///
/// Failures observed at submission time are returned through this type;
/// failures observed on completion ride on
/// [`TransferStatus`](crate::TransferStatus) instead.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An allocation or OS-primitive creation failed.
    #[error("out of memory")]
    NoMem,
    /// Malformed arguments.
    #[error("invalid parameter")]
    InvalidParam,
    /// The OS reported contention; retry after releasing something.
    #[error("device or resource busy")]
    Busy,
    /// The target device is gone.
    #[error("no such device")]
    NoDevice,
    /// Permission denied opening the device.
    #[error("access denied")]
    Access,
    /// The requested entity does not exist.
    #[error("entity not found")]
    NotFound,
    /// The backend lacks an optional capability; callers may fall back.
    #[error("operation not supported")]
    NotSupported,
    /// Surfaced by timer-driven cancellation above the core.
    #[error("operation timed out")]
    Timeout,
    /// A system call was interrupted.
    #[error("interrupted")]
    Interrupted,
    /// More data is available than the submitted buffer can hold.
    #[error("overflow")]
    Overflow,
    /// The endpoint stalled.
    #[error("endpoint stalled")]
    Pipe,
    /// Unspecified OS I/O failure.
    #[error("I/O error")]
    Io(#[source] io::Error),
}

/// Specialized `Result` type for dispatcher and backend operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(unix)]
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOMEM) => Self::NoMem,
            Some(libc::EINVAL) => Self::InvalidParam,
            Some(libc::EBUSY) => Self::Busy,
            Some(libc::ENODEV) | Some(libc::ENXIO) => Self::NoDevice,
            Some(libc::EACCES) | Some(libc::EPERM) => Self::Access,
            Some(libc::ENOENT) => Self::NotFound,
            Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP) => Self::NotSupported,
            Some(libc::ETIMEDOUT) => Self::Timeout,
            Some(libc::EINTR) => Self::Interrupted,
            Some(libc::EOVERFLOW) => Self::Overflow,
            Some(libc::EPIPE) => Self::Pipe,
            _ => Self::Io(err),
        }
    }
}

#[cfg(windows)]
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        use windows_sys::Win32::Foundation::{
            ERROR_ACCESS_DENIED, ERROR_BUSY, ERROR_FILE_NOT_FOUND, ERROR_INVALID_PARAMETER,
            ERROR_NOT_ENOUGH_MEMORY, ERROR_NOT_SUPPORTED, ERROR_OUTOFMEMORY,
            ERROR_PATH_NOT_FOUND, WAIT_TIMEOUT,
        };

        match err.raw_os_error().map(|code| code as u32) {
            Some(ERROR_NOT_ENOUGH_MEMORY) | Some(ERROR_OUTOFMEMORY) => Self::NoMem,
            Some(ERROR_INVALID_PARAMETER) => Self::InvalidParam,
            Some(ERROR_BUSY) => Self::Busy,
            Some(ERROR_ACCESS_DENIED) => Self::Access,
            Some(ERROR_FILE_NOT_FOUND) | Some(ERROR_PATH_NOT_FOUND) => Self::NotFound,
            Some(ERROR_NOT_SUPPORTED) => Self::NotSupported,
            Some(WAIT_TIMEOUT) => Self::Timeout,
            _ => Self::Io(err),
        }
    }
}
