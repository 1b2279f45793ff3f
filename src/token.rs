//! Associates a poller event with the handle or request that produced it.
//!
//! Mirrors mio's own `Token`: a thin newtype over `usize` rather than an
//! opaque associated type, so a `Poller` implementation can stash it
//! directly in a kernel event record (`epoll_event.u64`, `OVERLAPPED`'s
//! containing `Request`) without a lookup table of its own.

use std::fmt;

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Token(pub usize);

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<usize> for Token {
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
