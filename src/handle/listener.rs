//! Listening sockets (spec §3 "Handle" kind `Listener`, §4.3).

use crate::error::{ErrorKind, Result};
use crate::request::Request;
use crate::socket::{NetAddr, Socket};

pub struct ListenerState {
    pub socket: Socket,
    pub local_addr: NetAddr,
}

impl ListenerState {
    pub fn bind(addr: std::net::SocketAddr, backlog: i32) -> Result<ListenerState> {
        let socket = Socket::new_tcp(addr)?;
        socket.set_reuse_address(true)?;
        socket.bind(addr)?;
        socket.listen(backlog)?;
        let local_addr = socket.local_addr()?;
        Ok(ListenerState { socket, local_addr })
    }

    /// One non-blocking `accept` attempt, filling `req.accept` on success.
    /// Returns `ErrorKind::Retry` if no connection is waiting yet — the
    /// caller leaves the request queued for the next readiness event
    /// (spec §4.3's per-handle read queue).
    pub fn accept(&self, req: &mut Request) -> Result<ErrorKind> {
        match self.socket.inner.accept() {
            Ok((peer, addr)) => {
                use std::os::unix::io::IntoRawFd;
                req.accept.local = Some(self.local_addr.0);
                req.accept.remote = addr.as_socket();
                #[cfg(unix)]
                {
                    req.accept.accepted_fd = Some(peer.into_raw_fd());
                }
                #[cfg(not(unix))]
                {
                    let _ = peer;
                }
                Ok(ErrorKind::Ok)
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(ErrorKind::Retry),
            Err(err) => Err(err.into()),
        }
    }
}
