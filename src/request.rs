//! Per-operation I/O descriptors (spec §3 "Request", §4.2).
//!
//! A `Request` is allocated from a per-[`Loop`](crate::loop_::Loop) pool
//! (`RequestPool`) with a power-of-two capacity buffer, reused via a
//! freelist (`slab::Slab`) the way mio's own `util/slab.rs` (now just the
//! `slab` crate) backs its handle table. `new_request`/`delete_request`
//! from the spec become `RequestPool::acquire`/`release`.

use std::net::SocketAddr;

use crate::error::ErrorKind;
use crate::handle::HandleId;

/// Index into a [`RequestPool`]'s slab.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RequestId(pub usize);

/// The operation a [`Request`] performs once its owning handle is ready
/// (readiness family) or once the OS reports completion (completion
/// family).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
    ReadFrom,
    WriteTo,
    Accept,
    Connect,
    Disconnect,
}

/// Accept requests additionally carry a socket slot and address cache,
/// sized for two endpoint addresses plus the padding `AcceptEx`-style APIs
/// require (spec §4.2).
#[derive(Debug, Default)]
pub struct AcceptState {
    pub accepted_fd: Option<std::os::raw::c_int>,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

/// A single posted I/O operation.
///
/// `handle` is set when the request is posted to a handle and cleared once
/// its callback has run. `next` links this request into its owning
/// handle's per-direction pending queue on the readiness family (spec
/// §4.3's "Per-FD request queueing"); it is unused on the completion
/// family, which instead recovers the owning request from the native
/// completion record.
pub struct Request {
    pub kind: RequestKind,
    pub handle: Option<HandleId>,
    pub buf: Vec<u8>,
    /// Bytes filled (read) or bytes already sent (write), for partial
    /// operations that must resume rather than restart.
    pub used: usize,
    /// Byte offset for positional file reads/writes.
    pub file_offset: u64,
    pub error: ErrorKind,
    pub user_data: usize,
    pub accept: AcceptState,
    /// Invoked exactly once, on the loop thread, when this operation
    /// completes (spec §3 "Request"). Taking `&mut Loop` lets a callback
    /// post follow-up requests directly.
    pub callback: Option<RequestCallback>,
    pub(crate) next: Option<RequestId>,
    pub(crate) in_flight: bool,
    /// Set when this request's current completion came from a
    /// completion-family source (`io_uring`/IOCP) rather than a readiness
    /// event: the OS already performed the I/O directly into `buf`, so
    /// `finish_request` must not call `service_request` again.
    pub(crate) via_completion: bool,
}

/// A request completion callback (spec §6: "the Request's `callback`
/// is invoked on the loop thread when the operation completes").
pub type RequestCallback = Box<dyn FnOnce(&mut crate::loop_::Loop, RequestId)>;

impl Request {
    fn new(kind: RequestKind, capacity: usize) -> Request {
        Request {
            kind,
            handle: None,
            buf: Vec::with_capacity(capacity.next_power_of_two().max(1)),
            used: 0,
            file_offset: 0,
            error: ErrorKind::Ok,
            user_data: 0,
            accept: AcceptState::default(),
            callback: None,
            next: None,
            in_flight: false,
            via_completion: false,
        }
    }

    /// The still-unfilled tail of `buf` available to a read operation,
    /// i.e. everything past the `self.used` bytes already read. Tracked
    /// from `used` rather than `buf.len()`: `buf` is resized to full
    /// capacity (and stays there) the first time this is called, so on a
    /// WouldBlock retry of the same still-empty request `buf.len()` is
    /// already `cap` even though nothing has been read yet.
    pub fn writable_slice(&mut self) -> &mut [u8] {
        let cap = self.buf.capacity();
        if self.buf.len() < cap {
            self.buf.resize(cap, 0);
        }
        &mut self.buf[self.used..]
    }

    /// The filled prefix of `buf` up to `self.used` bytes — what a
    /// completed `Read`/`ReadFrom` produced (spec §3 "Request").
    pub fn readable_slice(&self) -> &[u8] {
        &self.buf[..self.used.min(self.buf.len())]
    }

    /// The still-unsent tail of `buf` for a write operation, i.e.
    /// everything past the `self.used` bytes already written out. Mirrors
    /// `writable_slice`'s use of `used` as a running offset, but growing
    /// toward `buf.len()` (fully sent) rather than toward capacity.
    pub fn unsent_slice(&self) -> &[u8] {
        &self.buf[self.used.min(self.buf.len())..]
    }

    fn reset(&mut self, kind: RequestKind, capacity: usize) {
        self.kind = kind;
        self.handle = None;
        self.buf.clear();
        self.buf.reserve(capacity.next_power_of_two().max(1));
        self.used = 0;
        self.file_offset = 0;
        self.error = ErrorKind::Ok;
        self.user_data = 0;
        self.accept = AcceptState::default();
        self.callback = None;
        self.next = None;
        self.in_flight = false;
        self.via_completion = false;
    }
}

/// Per-loop freelist of [`Request`]s, avoiding per-operation heap churn
/// (spec §4.2).
#[derive(Default)]
pub struct RequestPool {
    slab: slab::Slab<Request>,
    free: Vec<RequestId>,
}

impl RequestPool {
    pub fn new() -> RequestPool {
        RequestPool {
            slab: slab::Slab::new(),
            free: Vec::new(),
        }
    }

    /// `Request::new(capacity)` from spec §6.
    pub fn acquire(&mut self, kind: RequestKind, capacity: usize) -> RequestId {
        if let Some(id) = self.free.pop() {
            self.slab[id.0].reset(kind, capacity);
            id
        } else {
            RequestId(self.slab.insert(Request::new(kind, capacity)))
        }
    }

    /// `Request::delete(req)` from spec §6.
    pub fn release(&mut self, id: RequestId) {
        self.free.push(id);
    }

    pub fn get(&self, id: RequestId) -> &Request {
        &self.slab[id.0]
    }

    pub fn get_mut(&mut self, id: RequestId) -> &mut Request {
        &mut self.slab[id.0]
    }
}
