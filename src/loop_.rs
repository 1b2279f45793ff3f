//! The reactor loop (spec §3 "Lifecycles", §4.6, §5).
//!
//! One `Loop` per OS thread. It owns every handle, every in-flight
//! request, the timer wheel, and the pending ring; nothing here is
//! `Sync`, and the only safe cross-thread entry points are [`Waker`] and
//! [`TaskPoster`] — both touch only the lock-protected task queue, never
//! a handle directly.

use std::collections::VecDeque;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::channel::{self, Frame, FrameKind, Reassembler};
use crate::error::{ErrorKind, ReactorError, Result};
use crate::handle::datagram::DatagramState;
use crate::handle::file::FileState;
use crate::handle::listener::ListenerState;
use crate::handle::stream::StreamState;
use crate::handle::timer::TimerState;
use crate::handle::{Handle, HandleId, HandleKind, HandleResource};
use crate::poller::{Interest, PollEvent, Poller};
use crate::request::{Request, RequestCallback, RequestId, RequestKind, RequestPool};
use crate::socket::{Socket, SocketPair};
use crate::timer::TimerWheel;

#[cfg(unix)]
use crate::poller::readiness::ReadinessPoller as PlatformPoller;
#[cfg(windows)]
use crate::poller::completion::CompletionPoller as PlatformPoller;

#[cfg(target_os = "linux")]
use crate::poller::uring::SubmissionRing;

/// `Loop::open`/`Config` knobs (spec §6's "configuration struct").
#[derive(Clone, Copy, Debug)]
pub struct LoopConfig {
    /// `max` in `poller.wait(events, max, timeout)` (spec §4.6 step 2).
    pub max_events: usize,
    /// Upper bound on a computed wait when timers are far off (spec §4.6
    /// step 1: "capped at 1,000 ms").
    pub max_wait: Duration,
    /// `io_uring` submission-queue entry count.
    pub uring_entries: u32,
    /// Outstanding file-request cap before overflow queues locally (spec
    /// §4.5, §9: "treat as configuration, not a fixed constant").
    pub uring_depth: usize,
    /// Read buffer size for the command channel's persistent read.
    pub cmd_buf_size: usize,
}

impl Default for LoopConfig {
    fn default() -> LoopConfig {
        LoopConfig {
            max_events: 128,
            max_wait: Duration::from_millis(1000),
            uring_entries: 256,
            uring_depth: 2000,
            cmd_buf_size: 4096,
        }
    }
}

/// A unit of cross-thread work enqueued via [`TaskPoster::post`] and run
/// on the loop thread (spec §4.6 "Wakeup from other threads").
pub type Task = Box<dyn FnOnce(&mut Loop) + Send>;

/// Write-only handle to the loop's command socket, safe to hold from any
/// thread (spec §4.6: "a single wake command frame is written to the
/// loop's command socket").
pub struct Waker {
    socket: Socket,
}

impl Waker {
    pub fn wake(&self) -> Result<()> {
        match (&self.socket.inner).write(&[0u8]) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Cloneable cross-thread handle for `post_task` (spec §4.6, §6's
/// "loop-thread-safe variants via the command channel").
#[derive(Clone)]
pub struct TaskPoster {
    tasks: Arc<Mutex<VecDeque<Task>>>,
    waker: Arc<Waker>,
}

impl TaskPoster {
    pub fn post(&self, task: Task) -> Result<()> {
        let was_empty = {
            let mut queue = self.tasks.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        // Wake exactly once per empty->non-empty transition (spec §4.6,
        // testable scenario 3: "≤ 1,000 wakes" for 1,000 posts).
        if was_empty {
            self.waker.wake()?;
        }
        Ok(())
    }
}

enum Direction {
    Read,
    Write,
}

fn direction_of(kind: RequestKind) -> Direction {
    match kind {
        RequestKind::Read | RequestKind::ReadFrom | RequestKind::Accept => Direction::Read,
        RequestKind::Write | RequestKind::WriteTo | RequestKind::Connect | RequestKind::Disconnect => {
            Direction::Write
        }
    }
}

pub struct Loop {
    config: LoopConfig,
    handles: slab::Slab<Handle>,
    requests: RequestPool,
    timers: TimerWheel,
    pending: crate::pending::PendingRing,
    poller: PlatformPoller,
    #[cfg(target_os = "linux")]
    uring: SubmissionRing,
    closing: Vec<HandleId>,
    handle_count: usize,
    tasks: Arc<Mutex<VecDeque<Task>>>,
    waker: Arc<Waker>,
    cmd_handle: HandleId,
    cmd_reassembler: Reassembler,
    cmd_sn: u32,
    start: Instant,
    stop_requested: bool,
    heartbeats_sent: u64,
    heartbeats_recv: u64,
}

impl Loop {
    pub fn new(config: LoopConfig) -> Result<Loop> {
        let poller = Self::open_poller()?;
        #[cfg(target_os = "linux")]
        let uring = SubmissionRing::new(config.uring_entries, config.uring_depth)?;

        let pair = SocketPair::new()?;
        let waker_socket = pair.b.try_clone()?;
        let waker = Arc::new(Waker { socket: waker_socket });

        let mut this = Loop {
            config,
            handles: slab::Slab::new(),
            requests: RequestPool::new(),
            timers: TimerWheel::new(),
            pending: crate::pending::PendingRing::new(),
            poller,
            #[cfg(target_os = "linux")]
            uring,
            closing: Vec::new(),
            handle_count: 0,
            tasks: Arc::new(Mutex::new(VecDeque::new())),
            waker,
            cmd_handle: HandleId(0), // patched below
            cmd_reassembler: Reassembler::new(),
            cmd_sn: 0,
            start: Instant::now(),
            stop_requested: false,
            heartbeats_sent: 0,
            heartbeats_recv: 0,
        };

        let cmd_handle = this.open_handle(
            HandleKind::Stream,
            HandleResource::Stream(StreamState::from_accepted(pair.a)),
        )?;
        this.cmd_handle = cmd_handle;
        this.post_cmd_read()?;
        Ok(this)
    }

    #[cfg(unix)]
    fn open_poller() -> Result<PlatformPoller> {
        PlatformPoller::open()
    }

    #[cfg(windows)]
    fn open_poller() -> Result<PlatformPoller> {
        PlatformPoller::open()
    }

    pub fn now(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    pub fn task_poster(&self) -> TaskPoster {
        TaskPoster {
            tasks: Arc::clone(&self.tasks),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn handle_count(&self) -> usize {
        self.handle_count
    }

    fn file_submission_inflight(&self) -> usize {
        #[cfg(target_os = "linux")]
        {
            self.uring.inflight_count()
        }
        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }

    // ---- handle lifecycle (spec §3 "Lifecycles", §4.3 `open`/`close`) ----

    pub fn open_handle(&mut self, kind: HandleKind, resource: HandleResource) -> Result<HandleId> {
        let mut handle = Handle::new(kind, resource);
        handle.flags |= crate::handle::HandleFlags::OPEN;
        handle.grab = 1; // the loop's own reference (spec §5 "Reference counting")
        let id = HandleId(self.handles.insert(handle));
        self.handle_count += 1;

        if kind == HandleKind::Timer {
            let deadline = match &self.handles[id.0].resource {
                HandleResource::Timer(state) => self.now() + state.first_gap,
                _ => unreachable!(),
            };
            self.arm_timer(id, deadline);
        } else if kind != HandleKind::File {
            // Regular files go through the `io_uring` submission ring
            // exclusively (spec §4.5): `epoll_ctl(ADD)` on a file fd
            // fails with `EPERM`.
            if let Some(fd) = self.handles[id.0].raw_fd() {
                self.poller.add(id, fd, Interest::READABLE)?;
            }
        }
        Ok(id)
    }

    fn arm_timer(&mut self, id: HandleId, deadline: i64) {
        let key = self.timers.insert(deadline, id);
        if let HandleResource::Timer(state) = &mut self.handles[id.0].resource {
            state.key = Some(key);
        }
    }

    /// Idempotent (spec §8 law: "a second `close_handle(h)` returns
    /// `CLOSING` and produces no additional callbacks").
    pub fn close_handle(&mut self, id: HandleId) -> Result<()> {
        let Some(handle) = self.handles.get_mut(id.0) else {
            return Err(ReactorError::from_kind(ErrorKind::InvalidHandle));
        };
        if handle.is_closing() {
            return Err(ReactorError::from_kind(ErrorKind::Closing));
        }
        handle.flags |= crate::handle::HandleFlags::CLOSING;
        // Release the loop's own hold (spec §5 "Reference counting": "the
        // loop itself holds one reference between open and close").
        handle.grab = handle.grab.saturating_sub(1);

        if let HandleResource::Timer(state) = &mut handle.resource {
            if let Some(key) = state.key.take() {
                self.timers.remove(key, id);
            }
        } else if let Some(fd) = handle.raw_fd() {
            let _ = self.poller.remove(id, fd);
        }

        // Drain both per-handle queues into the pending ring with a
        // cancellation error (spec §4.6 "Cancellation").
        let handle = &mut self.handles[id.0];
        let drained: Vec<RequestId> = handle.read_queue.drain(..).chain(handle.write_queue.drain(..)).collect();
        for req_id in drained {
            self.requests.get_mut(req_id).error = ErrorKind::Closing;
            self.pending.push_tail(req_id);
        }

        if self.handles[id.0].is_destroyable() {
            self.closing.push(id);
        }
        Ok(())
    }

    fn destroy_handle(&mut self, id: HandleId) {
        if let Some(mut handle) = self.handles.try_remove(id.0) {
            handle.flags |= crate::handle::HandleFlags::CLOSED;
            if let Some(mut cb) = handle.close_callback.take() {
                cb(id);
            }
            self.handle_count -= 1;
        }
    }

    // ---- posting operations (spec §4.3 "request-posting methods") ----

    fn post(&mut self, id: HandleId, kind: RequestKind, capacity: usize, callback: RequestCallback) -> Result<RequestId> {
        let handle = self
            .handles
            .get(id.0)
            .ok_or_else(|| ReactorError::from_kind(ErrorKind::InvalidHandle))?;
        if handle.is_closing() {
            return Err(ReactorError::from_kind(ErrorKind::Closing));
        }

        let req_id = self.requests.acquire(kind, capacity);
        {
            let req = self.requests.get_mut(req_id);
            req.handle = Some(id);
            req.callback = Some(callback);
            req.in_flight = true;
        }

        let handle = &mut self.handles[id.0];
        handle.fly += 1;

        match direction_of(kind) {
            Direction::Read => {
                let sync_flag = crate::handle::HandleFlags::SYNC_READ;
                if handle.flags.contains(sync_flag) {
                    handle.flags.remove(sync_flag);
                    self.pending.push_tail(req_id);
                } else {
                    handle.read_queue.push_back(req_id);
                }
            }
            Direction::Write => {
                let sync_flag = crate::handle::HandleFlags::SYNC_WRITE;
                if handle.flags.contains(sync_flag) {
                    handle.flags.remove(sync_flag);
                    self.pending.push_tail(req_id);
                } else {
                    handle.write_queue.push_back(req_id);
                }
            }
        }

        self.sync_interest(id)?;
        Ok(req_id)
    }

    fn sync_interest(&mut self, id: HandleId) -> Result<()> {
        let handle = &self.handles[id.0];
        let Some(fd) = handle.raw_fd() else { return Ok(()) };
        let mut interest = Interest::empty();
        if !handle.read_queue.is_empty() {
            interest |= Interest::READABLE;
        }
        if !handle.write_queue.is_empty() {
            interest |= Interest::WRITABLE;
        }
        if interest.is_empty() {
            interest = Interest::READABLE;
        }
        self.poller.add(id, fd, interest)
    }

    pub fn post_read(&mut self, id: HandleId, capacity: usize, callback: RequestCallback) -> Result<RequestId> {
        self.post(id, RequestKind::Read, capacity, callback)
    }

    pub fn post_write(&mut self, id: HandleId, data: &[u8], callback: RequestCallback) -> Result<RequestId> {
        let req_id = self.post(id, RequestKind::Write, data.len(), callback)?;
        let req = self.requests.get_mut(req_id);
        req.buf.extend_from_slice(data);
        // `used` tracks bytes already sent (starts at 0, grows toward
        // `buf.len()`), not the payload length — see `unsent_slice`.
        Ok(req_id)
    }

    pub fn post_accept(&mut self, id: HandleId, callback: RequestCallback) -> Result<RequestId> {
        self.post(id, RequestKind::Accept, 0, callback)
    }

    pub fn post_connect(&mut self, id: HandleId, callback: RequestCallback) -> Result<RequestId> {
        self.post(id, RequestKind::Connect, 0, callback)
    }

    pub fn post_disconnect(&mut self, id: HandleId, callback: RequestCallback) -> Result<RequestId> {
        self.post(id, RequestKind::Disconnect, 0, callback)
    }

    pub fn post_read_from(&mut self, id: HandleId, capacity: usize, callback: RequestCallback) -> Result<RequestId> {
        self.post(id, RequestKind::ReadFrom, capacity, callback)
    }

    pub fn post_write_to(&mut self, id: HandleId, dest: SocketAddr, data: &[u8], callback: RequestCallback) -> Result<RequestId> {
        let req_id = self.post(id, RequestKind::WriteTo, data.len(), callback)?;
        let req = self.requests.get_mut(req_id);
        req.buf.extend_from_slice(data);
        req.accept.remote = Some(dest);
        Ok(req_id)
    }

    /// `Handle::timer(first_gap, gap, repeat, callback)` (spec §4.4).
    pub fn open_timer(&mut self, first_gap: i64, gap: i64, repeat: i64, callback: crate::handle::timer::TimerCallback) -> Result<HandleId> {
        let state = TimerState::new(first_gap, gap, repeat, callback);
        self.open_handle(HandleKind::Timer, HandleResource::Timer(state))
    }

    pub fn open_listener(&mut self, addr: SocketAddr, backlog: i32) -> Result<HandleId> {
        let state = ListenerState::bind(addr, backlog)?;
        self.open_handle(HandleKind::Listener, HandleResource::Listener(state))
    }

    pub fn open_connector(&mut self, addr: SocketAddr) -> Result<HandleId> {
        let state = StreamState::connect(addr)?;
        self.open_handle(HandleKind::Connector, HandleResource::Stream(state))
    }

    pub fn open_datagram(&mut self, addr: SocketAddr) -> Result<HandleId> {
        let state = DatagramState::bind(addr)?;
        self.open_handle(HandleKind::Datagram, HandleResource::Datagram(state))
    }

    pub fn open_file(&mut self, name: &str, write: bool) -> Result<HandleId> {
        let state = FileState::open(name, write)?;
        self.open_handle(HandleKind::File, HandleResource::File(state))
    }

    /// Positional read from a `File` handle via the `io_uring` submission
    /// ring (spec §4.5), bypassing the per-handle read queue entirely —
    /// there is no readiness event for a regular file, only a completion.
    #[cfg(target_os = "linux")]
    pub fn post_file_read(
        &mut self,
        id: HandleId,
        capacity: usize,
        offset: u64,
        callback: RequestCallback,
    ) -> Result<RequestId> {
        let handle = self
            .handles
            .get(id.0)
            .ok_or_else(|| ReactorError::from_kind(ErrorKind::InvalidHandle))?;
        if handle.is_closing() {
            return Err(ReactorError::from_kind(ErrorKind::Closing));
        }
        let fd = match &handle.resource {
            HandleResource::File(state) => state.raw_fd(),
            _ => return Err(ReactorError::from_kind(ErrorKind::InvalidHandle)),
        };

        let req_id = self.requests.acquire(RequestKind::Read, capacity);
        let req = self.requests.get_mut(req_id);
        req.handle = Some(id);
        req.callback = Some(callback);
        req.in_flight = true;
        req.file_offset = offset;
        let slice = req.writable_slice();
        let ptr = slice.as_mut_ptr();
        let len = slice.len() as u32;

        self.handles[id.0].fly += 1;
        self.uring.submit_read(req_id, fd, ptr, len, offset);
        Ok(req_id)
    }

    /// Positional write to a `File` handle via the `io_uring` submission
    /// ring (spec §4.5). A partial completion (the kernel wrote fewer
    /// bytes than submitted) resubmits the remaining tail rather than
    /// firing the callback early, mirroring the partial-write handling
    /// `handle::stream::write_from` does for sockets (spec §7).
    #[cfg(target_os = "linux")]
    pub fn post_file_write(
        &mut self,
        id: HandleId,
        offset: u64,
        data: &[u8],
        callback: RequestCallback,
    ) -> Result<RequestId> {
        let handle = self
            .handles
            .get(id.0)
            .ok_or_else(|| ReactorError::from_kind(ErrorKind::InvalidHandle))?;
        if handle.is_closing() {
            return Err(ReactorError::from_kind(ErrorKind::Closing));
        }
        let fd = match &handle.resource {
            HandleResource::File(state) => state.raw_fd(),
            _ => return Err(ReactorError::from_kind(ErrorKind::InvalidHandle)),
        };

        let req_id = self.requests.acquire(RequestKind::Write, data.len());
        let req = self.requests.get_mut(req_id);
        req.handle = Some(id);
        req.callback = Some(callback);
        req.in_flight = true;
        req.file_offset = offset;
        req.buf.extend_from_slice(data);
        let slice = req.unsent_slice();
        let ptr = slice.as_ptr();
        let len = slice.len() as u32;

        self.handles[id.0].fly += 1;
        self.uring.submit_write(req_id, fd, ptr, len, offset);
        Ok(req_id)
    }

    /// Resubmit the unsent tail of a partially-completed file write at its
    /// advanced offset (spec §7: "partial success is reported only once
    /// every byte is sent").
    #[cfg(target_os = "linux")]
    fn resubmit_file_write(&mut self, handle_id: HandleId, req_id: RequestId) {
        let fd = match &self.handles[handle_id.0].resource {
            HandleResource::File(state) => state.raw_fd(),
            _ => return,
        };
        let req = self.requests.get_mut(req_id);
        let offset = req.file_offset + req.used as u64;
        let slice = req.unsent_slice();
        let ptr = slice.as_ptr();
        let len = slice.len() as u32;
        self.uring.submit_write(req_id, fd, ptr, len, offset);
    }

    /// Turn a just-accepted descriptor (`req.accept.accepted_fd` after an
    /// `Accept` request completes) into its own `Stream` handle (spec
    /// §4.3).
    #[cfg(unix)]
    pub fn open_accepted_stream(&mut self, fd: std::os::raw::c_int) -> Result<HandleId> {
        let socket = Socket::from_raw_fd(fd)?;
        let state = StreamState::from_accepted(socket);
        self.open_handle(HandleKind::Stream, HandleResource::Stream(state))
    }

    /// Read a completed request's result buffer (spec §3 "Request":
    /// `buf`/`used` are the fields a callback inspects to see what a
    /// `Read`/`ReadFrom` produced).
    pub fn request_data(&self, req_id: RequestId) -> &[u8] {
        self.requests.get(req_id).readable_slice()
    }

    pub fn request_error(&self, req_id: RequestId) -> ErrorKind {
        self.requests.get(req_id).error
    }

    pub fn request_accept(&self, req_id: RequestId) -> &crate::request::AcceptState {
        &self.requests.get(req_id).accept
    }

    pub fn request_user_data(&self, req_id: RequestId) -> usize {
        self.requests.get(req_id).user_data
    }

    pub fn set_request_user_data(&mut self, req_id: RequestId, value: usize) {
        self.requests.get_mut(req_id).user_data = value;
    }

    /// The bound local address of a `Listener`, `Stream`/`Connector`, or
    /// `Datagram` handle (mio's own `local_addr()` accessor, lifted to
    /// the handle level since a `Request` has no socket of its own to
    /// ask).
    pub fn local_addr(&self, id: HandleId) -> Result<crate::socket::NetAddr> {
        let handle = self
            .handles
            .get(id.0)
            .ok_or_else(|| ReactorError::from_kind(ErrorKind::InvalidHandle))?;
        match &handle.resource {
            HandleResource::Listener(state) => Ok(state.local_addr),
            HandleResource::Stream(state) => state.socket.local_addr(),
            HandleResource::Datagram(state) => state.socket.local_addr(),
            _ => Err(ReactorError::from_kind(ErrorKind::InvalidParam)),
        }
    }

    // ---- command channel (spec §4.6 "Wakeup", §4.7) ----

    fn post_cmd_read(&mut self) -> Result<()> {
        let cap = self.config.cmd_buf_size;
        self.post_read(
            self.cmd_handle,
            cap,
            Box::new(|loop_, req_id| {
                let _ = loop_.on_cmd_read(req_id);
            }),
        )?;
        Ok(())
    }

    fn on_cmd_read(&mut self, req_id: RequestId) -> Result<()> {
        let req = self.requests.get(req_id);
        let bytes = req.buf[..req.used].to_vec();
        if !bytes.is_empty() {
            self.cmd_reassembler.feed(&bytes);
            while let Some(frame) = self
                .cmd_reassembler
                .pop_frame()
                .map_err(|e| ReactorError::from(e))?
            {
                self.dispatch_frame(frame)?;
            }
        }
        if !self.handles[self.cmd_handle.0].is_closing() {
            self.post_cmd_read()?;
        }
        Ok(())
    }

    fn dispatch_frame(&mut self, frame: Frame) -> Result<()> {
        match frame.kind {
            FrameKind::Exit => {
                self.send_cmd_frame(FrameKind::ExitResp, frame.sn, Vec::new())?;
                // Every handle on the active list transitions through
                // CLOSING -> CLOSE on graceful shutdown (spec §4.9
                // scenario 4), not just the command channel itself.
                let ids: Vec<HandleId> = self.handles.iter().map(|(k, _)| HandleId(k)).collect();
                for id in ids {
                    let _ = self.close_handle(id);
                }
                self.stop_requested = true;
            }
            FrameKind::Heartbeat => {
                self.heartbeats_recv += 1;
                self.send_cmd_frame(FrameKind::HeartbeatResp, frame.sn, Vec::new())?;
            }
            FrameKind::HeartbeatResp => {
                self.heartbeats_sent += 1;
            }
            FrameKind::Task | FrameKind::Respawn | FrameKind::Version | FrameKind::ExitResp => {
                // Task frames are pure wakeups (the payload lives in the
                // in-memory task queue, drained in run_once step 7);
                // Respawn/Version are advisory to the supervisor side.
            }
        }
        Ok(())
    }

    fn send_cmd_frame(&mut self, kind: FrameKind, sn: u32, payload: Vec<u8>) -> Result<()> {
        if let HandleResource::Stream(state) = &self.handles[self.cmd_handle.0].resource {
            let frame = Frame::new(kind, sn, payload);
            let mut socket = &state.socket.inner;
            channel::send_frame(&mut socket, &frame)?;
        }
        Ok(())
    }

    pub fn send_heartbeat(&mut self) -> Result<()> {
        self.cmd_sn += 1;
        self.send_cmd_frame(FrameKind::Heartbeat, self.cmd_sn, Vec::new())
    }

    // ---- the reactor loop itself (spec §4.6) ----

    /// One iteration of the eight numbered steps.
    pub fn run_once(&mut self) -> Result<bool> {
        // Step 1.
        let wait = if !self.pending.is_empty() || !self.closing.is_empty() {
            Some(Duration::ZERO)
        } else {
            match self.timers.peek_deadline() {
                Some(deadline) => {
                    let delta = (deadline - self.now()).max(0) as u64;
                    Some(Duration::from_millis(delta).min(self.config.max_wait))
                }
                None => Some(self.config.max_wait),
            }
        };

        #[cfg(target_os = "linux")]
        self.uring.flush()?;

        // Step 2.
        let mut events = Vec::with_capacity(self.config.max_events);
        self.poller.wait(&mut events, self.config.max_events, wait)?;

        #[cfg(target_os = "linux")]
        self.uring.reap(&mut events);

        // Step 3.
        for event in events {
            match event {
                PollEvent::Ready {
                    handle,
                    readable,
                    writable,
                    hangup,
                    error,
                } => self.handle_readiness(handle, readable, writable, hangup, error)?,
                PollEvent::Completed { request, result } => {
                    let req = self.requests.get_mut(request);
                    // The OS already performed the I/O directly into
                    // `buf`: `finish_request` must not route this through
                    // `service_request`'s readiness-family syscalls.
                    req.via_completion = true;
                    match result {
                        Ok(n) => {
                            req.used += n;
                            req.error = ErrorKind::Ok;
                        }
                        Err(kind) => req.error = kind,
                    }
                    self.pending.push_tail(request);
                }
            }
        }

        // Step 4 + 5: drain pending, dispatching by kind, then fire
        // callbacks and drop fly references.
        while let Some(req_id) = self.pending.pop_head() {
            self.finish_request(req_id)?;
        }

        // Step 6: timer tick.
        self.tick_timers();

        // Step 7: cross-thread task queue (spec §5 ordering guarantee d:
        // "run on the loop thread in the order they were enqueued").
        let drained: Vec<Task> = {
            let mut queue = self.tasks.lock().unwrap();
            queue.drain(..).collect()
        };
        for task in drained {
            task(self);
        }

        // Step 8 (closing drain runs after so a task/timer callback that
        // closed a handle this tick is swept immediately).
        let closing = std::mem::take(&mut self.closing);
        for id in closing {
            self.destroy_handle(id);
        }

        Ok(!self.stop_requested && (self.handle_count > 0 || self.file_submission_inflight() > 0))
    }

    pub fn run(&mut self) -> Result<()> {
        while self.run_once()? {}
        Ok(())
    }

    fn handle_readiness(&mut self, id: HandleId, readable: bool, writable: bool, hangup: bool, error: bool) -> Result<()> {
        let Some(handle) = self.handles.get_mut(id.0) else {
            return Ok(());
        };
        if readable || hangup || error {
            if let Some(req_id) = handle.read_queue.pop_front() {
                self.pending.push_tail(req_id);
            } else {
                handle.flags |= crate::handle::HandleFlags::SYNC_READ;
            }
        }
        if writable {
            let handle = &mut self.handles[id.0];
            if let Some(req_id) = handle.write_queue.pop_front() {
                self.pending.push_tail(req_id);
            } else {
                handle.flags |= crate::handle::HandleFlags::SYNC_WRITE;
            }
        }
        Ok(())
    }

    /// Perform the actual I/O for one pending request (spec §4.6 step 4),
    /// then run its callback and drop its fly reference (step 5).
    fn finish_request(&mut self, req_id: RequestId) -> Result<()> {
        let Some(handle_id) = self.requests.get(req_id).handle else {
            return Ok(());
        };
        if self.handles.get(handle_id.0).is_none() {
            self.requests.release(req_id);
            return Ok(());
        }
        if self.handles[handle_id.0].is_closing() && self.requests.get(req_id).error == ErrorKind::Ok {
            self.requests.get_mut(req_id).error = ErrorKind::Closing;
        }

        let kind = self.requests.get(req_id).kind;
        let via_completion = self.requests.get(req_id).via_completion;

        if via_completion {
            // The kernel already performed this I/O (io_uring/IOCP); only
            // a partial file write needs further action, resubmitting its
            // unsent tail instead of completing early (spec §7).
            #[cfg(target_os = "linux")]
            if self.requests.get(req_id).error == ErrorKind::Ok
                && kind == RequestKind::Write
                && self.requests.get(req_id).used < self.requests.get(req_id).buf.len()
            {
                self.resubmit_file_write(handle_id, req_id);
                return Ok(());
            }
            self.requests.get_mut(req_id).via_completion = false;
            self.run_callback(handle_id, req_id);
            return Ok(());
        }

        if self.requests.get(req_id).error == ErrorKind::Ok {
            let outcome = self.service_request(handle_id, kind, req_id)?;
            if outcome == ErrorKind::Retry {
                // Re-queue at head: no callback yet (spec §8 boundary
                // behavior: "RETRY ... request re-queued at head").
                let handle = &mut self.handles[handle_id.0];
                match direction_of(kind) {
                    Direction::Read => handle.read_queue.push_front(req_id),
                    Direction::Write => handle.write_queue.push_front(req_id),
                }
                return Ok(());
            }
            self.requests.get_mut(req_id).error = outcome;
        }

        self.run_callback(handle_id, req_id);
        Ok(())
    }

    /// Tight inner loop for the readiness family: perform the syscall,
    /// and if it succeeds try to drain the handle's same-direction queue
    /// too (spec §4.6 step 4), returning the *last* request's outcome —
    /// callers other than the tight loop only ever pass one request.
    fn service_request(&mut self, handle_id: HandleId, kind: RequestKind, req_id: RequestId) -> Result<ErrorKind> {
        // Hard I/O errors here are converted to `ErrorKind::Error` rather
        // than propagated with `?`: this method's caller delivers its
        // return value to the request's callback, so a short-circuiting
        // `Err` would skip the callback entirely, violating the
        // exactly-once delivery guarantee (spec §7, §9).
        let outcome = match kind {
            RequestKind::Accept => {
                let HandleResource::Listener(state) = &self.handles[handle_id.0].resource else {
                    return Ok(ErrorKind::InvalidHandle);
                };
                let req = self.requests.get_mut(req_id);
                state.accept(req).unwrap_or(ErrorKind::Error)
            }
            RequestKind::Read => {
                let HandleResource::Stream(state) = &self.handles[handle_id.0].resource else {
                    return Ok(ErrorKind::InvalidHandle);
                };
                let req = self.requests.get_mut(req_id);
                state.read_into(req).unwrap_or(ErrorKind::Error)
            }
            RequestKind::Write => {
                let HandleResource::Stream(state) = &self.handles[handle_id.0].resource else {
                    return Ok(ErrorKind::InvalidHandle);
                };
                let req = self.requests.get_mut(req_id);
                state.write_from(req).unwrap_or(ErrorKind::Error)
            }
            RequestKind::ReadFrom => {
                let HandleResource::Datagram(state) = &self.handles[handle_id.0].resource else {
                    return Ok(ErrorKind::InvalidHandle);
                };
                let req = self.requests.get_mut(req_id);
                state.read_from(req).unwrap_or(ErrorKind::Error)
            }
            RequestKind::WriteTo => {
                let HandleResource::Datagram(state) = &self.handles[handle_id.0].resource else {
                    return Ok(ErrorKind::InvalidHandle);
                };
                let req = self.requests.get_mut(req_id);
                state.write_to(req).unwrap_or(ErrorKind::Error)
            }
            RequestKind::Connect => {
                let HandleResource::Stream(state) = &mut self.handles[handle_id.0].resource else {
                    return Ok(ErrorKind::InvalidHandle);
                };
                state.poll_connect().unwrap_or(ErrorKind::Error)
            }
            RequestKind::Disconnect => {
                let HandleResource::Stream(state) = &self.handles[handle_id.0].resource else {
                    return Ok(ErrorKind::InvalidHandle);
                };
                match state.shutdown() {
                    Ok(()) => ErrorKind::Ok,
                    Err(_) => ErrorKind::Error,
                }
            }
        };

        // On a datagram/stream handle, connected read/write also drains
        // the rest of the same-direction queue while the OS still has
        // data/space (spec §4.6 step 4's "tight inner loop"), except for
        // Accept, which spec §4.3 explicitly allows to reorder rather
        // than strictly drain head-first every time.
        if outcome == ErrorKind::Ok && !matches!(kind, RequestKind::Accept | RequestKind::Connect) {
            self.drain_same_direction(handle_id, kind);
        }
        Ok(outcome)
    }

    fn drain_same_direction(&mut self, handle_id: HandleId, kind: RequestKind) {
        loop {
            let next = match direction_of(kind) {
                Direction::Read => self.handles[handle_id.0].read_queue.front().copied(),
                Direction::Write => self.handles[handle_id.0].write_queue.front().copied(),
            };
            let Some(next_id) = next else { break };
            let outcome = match self.service_request(handle_id, kind, next_id) {
                Ok(o) => o,
                Err(_) => ErrorKind::Error,
            };
            if outcome == ErrorKind::Retry {
                break;
            }
            match direction_of(kind) {
                Direction::Read => self.handles[handle_id.0].read_queue.pop_front(),
                Direction::Write => self.handles[handle_id.0].write_queue.pop_front(),
            };
            self.requests.get_mut(next_id).error = outcome;
            self.run_callback(handle_id, next_id);
            if outcome != ErrorKind::Ok {
                break;
            }
        }
    }

    fn run_callback(&mut self, handle_id: HandleId, req_id: RequestId) {
        let callback = self.requests.get_mut(req_id).callback.take();
        if let Some(cb) = callback {
            cb(self, req_id);
        }
        self.requests.release(req_id);

        if let Some(handle) = self.handles.get_mut(handle_id.0) {
            handle.fly = handle.fly.saturating_sub(1);
            if handle.is_destroyable() && handle.is_closing() && !self.closing.contains(&handle_id) {
                self.closing.push(handle_id);
            }
        }
    }

    fn tick_timers(&mut self) {
        let now = self.now();
        let expired = self.timers.pop_expired(now);
        for (_, id) in expired {
            let Some(handle) = self.handles.get_mut(id.0) else { continue };
            let is_closing = handle.is_closing();
            let HandleResource::Timer(state) = &mut handle.resource else { continue };
            let Some(callback) = state.callback.as_mut() else { continue };
            let rc = callback(id);
            state.consume_repeat();
            let keep = rc == 0 && state.has_repeats_left() && !is_closing;
            let next_deadline = now + state.gap;

            if keep {
                self.arm_timer(id, next_deadline);
            } else {
                let _ = self.close_handle(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_frame_closes_every_open_handle_not_just_the_command_channel() {
        let mut loop_ = Loop::new(LoopConfig::default()).unwrap();
        loop_
            .open_timer(1_000_000, 1_000_000, -1, Box::new(|_id| 0))
            .unwrap();
        assert_eq!(loop_.handle_count(), 2); // cmd_handle + the timer

        let frame = Frame::new(FrameKind::Exit, 1, Vec::new());
        loop_.dispatch_frame(frame).unwrap();
        assert!(loop_.stop_requested);

        // `dispatch_frame` only marks handles CLOSING and, where already
        // destroyable, queues them; `run_once`'s step 8 is what actually
        // destroys them and fires close callbacks.
        loop_.run_once().unwrap();
        assert_eq!(loop_.handle_count(), 0);
    }
}
