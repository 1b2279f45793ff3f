//! The handle hierarchy (spec §3 "Handle"/"HandleTime", §4.3).
//!
//! A [`Handle`] is a refcounted wrapper over an OS resource — listening
//! socket, connected stream, datagram endpoint, regular file, or timer —
//! identified by a [`HandleId`] (an index into the owning
//! [`Loop`](crate::loop_::Loop)'s slab) rather than a raw back-pointer.
//! Per spec §9's design note, this replaces the original's
//! `Handle -> Loop -> Handle` cyclic pointer graph: the loop is a thread
//! singleton anyway, so handles only ever need their own id to ask it for
//! anything.

pub mod datagram;
pub mod file;
pub mod listener;
pub mod stream;
pub mod timer;

use std::collections::VecDeque;

use bitflags::bitflags;

use crate::request::RequestId;

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct HandleId(pub usize);

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum HandleKind {
    Unknown,
    Timer,
    Listener,
    Connector,
    Stream,
    Datagram,
    File,
}

bitflags! {
    /// Flag word from spec §3.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        const OPEN       = 0b0000_0001;
        const CLOSING    = 0b0000_0010;
        const CLOSED     = 0b0000_0100;
        const READABLE   = 0b0000_1000;
        const WRITABLE   = 0b0001_0000;
        const SYNC_READ  = 0b0010_0000;
        const SYNC_WRITE = 0b0100_0000;
    }
}

/// Kind-specific OS state. Each variant is populated and drained by the
/// matching `handle::{listener,stream,datagram,file,timer}` module.
pub enum HandleResource {
    Listener(listener::ListenerState),
    Stream(stream::StreamState),
    Datagram(datagram::DatagramState),
    File(file::FileState),
    Timer(timer::TimerState),
}

pub type CloseCallback = Box<dyn FnMut(HandleId)>;

/// A refcounted resource owner (spec §3's invariants a-d).
pub struct Handle {
    pub kind: HandleKind,
    pub flags: HandleFlags,
    /// Strong-holder count. The loop itself holds one reference between
    /// `open` and `close`.
    pub grab: usize,
    /// Outstanding-I/O count; a handle with `fly > 0` is never destroyed
    /// even if `grab` reaches zero (invariant a).
    pub fly: usize,
    pub user_data: usize,
    pub close_callback: Option<CloseCallback>,
    pub resource: HandleResource,
    /// Per-handle pending-request rings (readiness family only, spec
    /// §4.3). Expressed as `VecDeque` rather than an intrusive
    /// singly-linked ring — see DESIGN.md for the tradeoff.
    pub read_queue: VecDeque<RequestId>,
    pub write_queue: VecDeque<RequestId>,
}

impl Handle {
    pub fn new(kind: HandleKind, resource: HandleResource) -> Handle {
        Handle {
            kind,
            flags: HandleFlags::default(),
            grab: 0,
            fly: 0,
            user_data: 0,
            close_callback: None,
            resource,
            read_queue: VecDeque::new(),
            write_queue: VecDeque::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.flags.contains(HandleFlags::OPEN)
    }

    pub fn is_closing(&self) -> bool {
        self.flags.contains(HandleFlags::CLOSING)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.contains(HandleFlags::CLOSED)
    }

    /// Whether this handle is fully drained and may be destroyed
    /// (invariant a).
    pub fn is_destroyable(&self) -> bool {
        self.grab == 0 && self.fly == 0
    }

    pub fn raw_fd(&self) -> Option<std::os::raw::c_int> {
        use std::os::unix::io::AsRawFd;
        match &self.resource {
            HandleResource::Listener(s) => Some(s.socket.as_raw_fd()),
            HandleResource::Stream(s) => Some(s.socket.as_raw_fd()),
            HandleResource::Datagram(s) => Some(s.socket.as_raw_fd()),
            HandleResource::File(f) => Some(f.file.as_raw_fd()),
            HandleResource::Timer(_) => None,
        }
    }
}
