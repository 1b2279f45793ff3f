//! The poller abstraction (spec §4.5): one contract, two families.
//!
//! [`poller::readiness`] wraps epoll and reports "this FD can now be read
//! or written without blocking"; [`poller::completion`] wraps Windows IOCP
//! and reports "this I/O you posted finished with this result".
//! [`poller::uring`] is the Linux-only file-submission ring that sits
//! alongside the readiness poller, since neither epoll nor IOCP's model
//! fits positional file I/O well on Linux (spec §4.5's "poller
//! additionally owns an attached submission queue for file operations").

#[cfg(unix)]
pub mod readiness;
#[cfg(windows)]
pub mod completion;
#[cfg(target_os = "linux")]
pub mod uring;

use std::time::Duration;

use bitflags::bitflags;

use crate::error::Result;
use crate::handle::HandleId;
use crate::request::RequestId;

bitflags! {
    /// Readiness interest a readiness-family poller should monitor.
    /// Ignored (per spec §4.5) by the completion family, where everything
    /// is per-operation rather than per-FD.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

/// A single event surfaced by [`Poller::wait`], unifying both families so
/// the loop can drain them with one code path.
#[derive(Debug)]
pub enum PollEvent {
    /// Readiness family: `handle` can now be read and/or written.
    Ready {
        handle: HandleId,
        readable: bool,
        writable: bool,
        /// Peer half-closed / hung up (e.g. `EPOLLRDHUP`).
        hangup: bool,
        error: bool,
    },
    /// Completion family: `request` finished with `result` bytes
    /// transferred, or an I/O error.
    Completed {
        request: RequestId,
        result: std::result::Result<usize, crate::error::ErrorKind>,
    },
}

/// The contract both poller families present to the loop.
pub trait Poller {
    /// Bind a handle's raw descriptor for future events. The completion
    /// family ignores `interest` (spec §4.5).
    fn add(&mut self, handle: HandleId, fd: std::os::raw::c_int, interest: Interest) -> Result<()>;

    /// Readiness-family only; the completion family removes implicitly on
    /// handle close.
    fn remove(&mut self, handle: HandleId, fd: std::os::raw::c_int) -> Result<()>;

    /// Block up to `timeout`, appending up to `max` events to `out`.
    /// `None` timeout means "wait as long as it takes"; `Some(Duration::ZERO)`
    /// returns immediately.
    fn wait(&mut self, out: &mut Vec<PollEvent>, max: usize, timeout: Option<Duration>) -> Result<usize>;
}
