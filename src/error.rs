//! Canonical error taxonomy (spec §6, §7).
//!
//! Every fallible operation in this crate returns a `Result<T>` built on
//! [`ReactorError`] rather than raising. OS errors are normalized into
//! [`ErrorKind`] at every boundary (syscall wrappers in `socket`, `poller`,
//! `shmem`) so callers never have to match on `io::ErrorKind` or raw errno
//! values themselves.

use std::fmt;
use std::io;

use thiserror::Error;

/// The canonical error kinds surfaced to user code (spec §6).
///
/// `Intr` and `Retry` are internal-only: the loop retries those itself
/// (§7) and they are never supposed to reach a callback. `Posted` means
/// "async submission accepted" and is mapped to success before a
/// `Request`'s callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Ok,
    NoOpen,
    NoReadable,
    NoWritable,
    Closing,
    InvalidHandle,
    InvalidParam,
    Retry,
    Timeout,
    Intr,
    Posted,
    TooManyFd,
    Error,
}

impl ErrorKind {
    /// Normalize a raw OS errno (as produced by `io::Error::raw_os_error`)
    /// into the canonical taxonomy.
    pub fn from_errno(errno: i32) -> ErrorKind {
        match errno {
            libc::EAGAIN => ErrorKind::Retry,
            #[allow(unreachable_patterns)] // EWOULDBLOCK == EAGAIN on Linux
            libc::EWOULDBLOCK => ErrorKind::Retry,
            libc::EINTR => ErrorKind::Intr,
            libc::ETIMEDOUT => ErrorKind::Timeout,
            libc::EMFILE | libc::ENFILE => ErrorKind::TooManyFd,
            libc::EINVAL => ErrorKind::InvalidParam,
            libc::EBADF => ErrorKind::InvalidHandle,
            _ => ErrorKind::Error,
        }
    }

    pub fn from_io_error(err: &io::Error) -> ErrorKind {
        match err.raw_os_error() {
            Some(errno) => ErrorKind::from_errno(errno),
            None => match err.kind() {
                io::ErrorKind::WouldBlock => ErrorKind::Retry,
                io::ErrorKind::TimedOut => ErrorKind::Timeout,
                io::ErrorKind::Interrupted => ErrorKind::Intr,
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorKind::InvalidParam,
                _ => ErrorKind::Error,
            },
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, ErrorKind::Ok | ErrorKind::Posted)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Ok => "ok",
            ErrorKind::NoOpen => "handle not open",
            ErrorKind::NoReadable => "handle not readable",
            ErrorKind::NoWritable => "handle not writable",
            ErrorKind::Closing => "handle is closing",
            ErrorKind::InvalidHandle => "invalid handle",
            ErrorKind::InvalidParam => "invalid parameter",
            ErrorKind::Retry => "retry",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Intr => "interrupted",
            ErrorKind::Posted => "posted",
            ErrorKind::TooManyFd => "too many open file descriptors",
            ErrorKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// The crate's error type. Carries a canonical [`ErrorKind`] plus, where
/// available, the underlying OS error for diagnostics.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("{kind}")]
    Kind { kind: ErrorKind },

    #[error("{kind}: {source}")]
    Io {
        kind: ErrorKind,
        #[source]
        source: io::Error,
    },

    #[error("unsupported socket option: {0}")]
    UnsupportedOption(&'static str),

    #[error("poller creation failed: {0}")]
    PollerInit(#[source] io::Error),

    #[error("shared memory mapping failed: {0}")]
    MmapInit(#[source] io::Error),
}

impl ReactorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReactorError::Kind { kind } => *kind,
            ReactorError::Io { kind, .. } => *kind,
            ReactorError::UnsupportedOption(_) => ErrorKind::InvalidParam,
            ReactorError::PollerInit(_) => ErrorKind::Error,
            ReactorError::MmapInit(_) => ErrorKind::Error,
        }
    }

    pub fn from_kind(kind: ErrorKind) -> ReactorError {
        ReactorError::Kind { kind }
    }
}

impl From<io::Error> for ReactorError {
    fn from(err: io::Error) -> ReactorError {
        let kind = ErrorKind::from_io_error(&err);
        ReactorError::Io { kind, source: err }
    }
}

pub type Result<T> = std::result::Result<T, ReactorError>;
