//! Errors of the ring itself, and decoding of operation results.
//!
//! The ring distinguishes three kinds of failure. Syscalls that set up or drive the ring fail
//! with [`Error`]. A full ring is not an error at all, see [`RingFull`](crate::RingFull). And an
//! operation that the kernel ran but that failed is reported as an ordinary completion whose
//! negative result is decoded here into an [`Errno`].

use std::{fmt, io};

use thiserror::Error;

/// Failures of ring setup, teardown and the enter/register syscalls.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io_uring syscall failed: {0}")]
    Io(#[from] io::Error),

    /// The kernel refused to pin the fixed buffer, usually because of `RLIMIT_MEMLOCK`.
    #[error("cannot pin a fixed buffer of {len} bytes: {source}")]
    ResourceExhausted { len: usize, source: io::Error },

    /// The fixed buffer cannot be addressed with 32-bit chunk offsets.
    #[error("fixed buffer of {0} bytes is larger than the registrable maximum")]
    BufferTooLarge(usize),

    #[error("queue depth must be between 1 and {max}, got {depth}")]
    InvalidQueueDepth { depth: u32, max: u32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

macro_rules! errnos {
    ($($(#[$meta:meta])* $variant:ident = $raw:ident,)+) => {
        /// System error numbers, as reported by failed operations.
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
        pub enum Errno {
            $($(#[$meta])* $variant,)+
            /// Any error number without a dedicated variant.
            Other(i32),
        }

        impl Errno {
            /// Translate a positive error number.
            pub fn from_raw(raw: i32) -> Self {
                match raw {
                    $(libc::$raw => Self::$variant,)+
                    other => Self::Other(other),
                }
            }
            /// The positive error number.
            pub fn raw(self) -> i32 {
                match self {
                    $(Self::$variant => libc::$raw,)+
                    Self::Other(other) => other,
                }
            }
        }
    };
}

errnos! {
    NotPermitted = EPERM,
    /// Also the result of a cancellation whose target was not found.
    NotFound = ENOENT,
    Interrupted = EINTR,
    Io = EIO,
    BadFd = EBADF,
    WouldBlock = EAGAIN,
    OutOfMemory = ENOMEM,
    AccessDenied = EACCES,
    Fault = EFAULT,
    Busy = EBUSY,
    Exists = EEXIST,
    CrossDevice = EXDEV,
    NotADirectory = ENOTDIR,
    IsADirectory = EISDIR,
    InvalidArgument = EINVAL,
    FileTableOverflow = ENFILE,
    TooManyOpenFiles = EMFILE,
    NoSpace = ENOSPC,
    IllegalSeek = ESPIPE,
    ReadOnlyFilesystem = EROFS,
    BrokenPipe = EPIPE,
    NameTooLong = ENAMETOOLONG,
    NotImplemented = ENOSYS,
    DirectoryNotEmpty = ENOTEMPTY,
    TooManySymlinks = ELOOP,
    /// A timer expired.
    TimerExpired = ETIME,
    NotSupported = EOPNOTSUPP,
    AddrInUse = EADDRINUSE,
    AddrNotAvailable = EADDRNOTAVAIL,
    NetworkUnreachable = ENETUNREACH,
    ConnectionAborted = ECONNABORTED,
    ConnectionReset = ECONNRESET,
    AlreadyConnected = EISCONN,
    NotConnected = ENOTCONN,
    TimedOut = ETIMEDOUT,
    ConnectionRefused = ECONNREFUSED,
    HostUnreachable = EHOSTUNREACH,
    Already = EALREADY,
    InProgress = EINPROGRESS,
    /// The operation was cancelled before it completed.
    Canceled = ECANCELED,
}

impl Errno {
    /// Translate a negative completion result; `None` for results that are not errors.
    pub fn from_result(result: i32) -> Option<Self> {
        if result < 0 {
            Some(Self::from_raw(-result))
        } else {
            None
        }
    }
}
impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&io::Error::from_raw_os_error(self.raw()), f)
    }
}
impl std::error::Error for Errno {}

impl From<Errno> for io::Error {
    fn from(errno: Errno) -> Self {
        io::Error::from_raw_os_error(errno.raw())
    }
}

/// Split a completion result into its success value and its error.
pub fn decode(result: i32) -> Result<u32, Errno> {
    if result < 0 {
        Err(Errno::from_raw(-result))
    } else {
        Ok(result as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_results_are_errors() {
        assert_eq!(decode(-libc::ENOENT), Err(Errno::NotFound));
        assert_eq!(decode(-libc::ECANCELED), Err(Errno::Canceled));
        assert_eq!(decode(0), Ok(0));
        assert_eq!(decode(4096), Ok(4096));
        assert_eq!(Errno::from_result(17), None);
    }

    #[test]
    fn unknown_numbers_round_trip() {
        let errno = Errno::from_raw(4000);
        assert_eq!(errno, Errno::Other(4000));
        assert_eq!(errno.raw(), 4000);
        assert_eq!(Errno::from_raw(libc::EAGAIN).raw(), libc::EAGAIN);
    }

    #[test]
    fn converts_into_io_errors() {
        let error: io::Error = Errno::BrokenPipe.into();
        assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(error.raw_os_error(), Some(libc::EPIPE));
        assert!(!Errno::TimedOut.to_string().is_empty());
    }
}
