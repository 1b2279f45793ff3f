//! epoll-backed readiness poller (spec §4.5 "Poller (readiness family)"),
//! grounded on the teacher's `sys/unix/selector/epoll.rs`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::error::Result;
use crate::handle::HandleId;
use crate::poller::{Interest, PollEvent, Poller};

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut events = EPOLLRDHUP as u32;
    if interest.contains(Interest::READABLE) {
        events |= EPOLLIN as u32;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= EPOLLOUT as u32;
    }
    events
}

fn syscall(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

pub struct ReadinessPoller {
    epoll: OwnedFd,
    raw_events: Vec<libc::epoll_event>,
}

impl ReadinessPoller {
    pub fn open() -> Result<ReadinessPoller> {
        // SAFETY: `epoll_create1` returns either a valid fd or -1.
        let fd = unsafe { syscall(libc::epoll_create1(libc::EPOLL_CLOEXEC))? };
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(ReadinessPoller {
            epoll,
            raw_events: Vec::new(),
        })
    }
}

impl Poller for ReadinessPoller {
    /// Idempotent: `loop_.rs`'s `sync_interest` calls this every time a
    /// handle's read/write queues change, which is almost always a
    /// re-registration of an fd already known to the epoll instance.
    /// Re-`ADD`ing a registered fd fails with `EEXIST`, so this tries
    /// `EPOLL_CTL_MOD` first and only falls back to `EPOLL_CTL_ADD` when
    /// the fd isn't registered yet (`ENOENT`).
    fn add(&mut self, handle: HandleId, fd: RawFd, interest: Interest) -> Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: handle.0 as u64,
        };
        unsafe {
            match syscall(libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_MOD,
                fd,
                &mut event,
            )) {
                Ok(_) => Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                    syscall(libc::epoll_ctl(
                        self.epoll.as_raw_fd(),
                        libc::EPOLL_CTL_ADD,
                        fd,
                        &mut event,
                    ))?;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
    }

    fn remove(&mut self, _handle: HandleId, fd: RawFd) -> Result<()> {
        unsafe {
            syscall(libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            ))?;
        }
        Ok(())
    }

    fn wait(&mut self, out: &mut Vec<PollEvent>, max: usize, timeout: Option<Duration>) -> Result<usize> {
        if self.raw_events.len() < max {
            self.raw_events.resize(max, unsafe { std::mem::zeroed() });
        }
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d
                .checked_add(Duration::from_nanos(999_999))
                .unwrap_or(d)
                .as_millis() as libc::c_int,
        };

        let n = loop {
            match unsafe {
                syscall(libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    self.raw_events.as_mut_ptr(),
                    max as libc::c_int,
                    timeout_ms,
                ))
            } {
                Ok(n) => break n as usize,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };

        for raw in &self.raw_events[..n] {
            let events = raw.events as i32;
            out.push(PollEvent::Ready {
                handle: HandleId(raw.u64 as usize),
                readable: events & EPOLLIN != 0,
                writable: events & EPOLLOUT != 0,
                hangup: events & (EPOLLHUP | EPOLLRDHUP) != 0,
                error: events & EPOLLERR != 0,
            });
        }
        Ok(n)
    }
}
