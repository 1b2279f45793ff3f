//! Connected stream sockets (spec §3 "Handle" kind `Stream`/`Connector`,
//! §4.3, §4.6 step 4's "tight inner loop" for the readiness family).

use std::io::{Read, Write};
use std::net::SocketAddr;

use crate::error::{ErrorKind, Result};
use crate::request::Request;
use crate::socket::Socket;

pub struct StreamState {
    pub socket: Socket,
    pub connecting: bool,
}

impl StreamState {
    pub fn connect(addr: SocketAddr) -> Result<StreamState> {
        let socket = Socket::new_tcp(addr)?;
        socket.connect(addr)?;
        Ok(StreamState {
            socket,
            connecting: true,
        })
    }

    pub fn from_accepted(socket: Socket) -> StreamState {
        StreamState {
            socket,
            connecting: false,
        }
    }

    /// Resolve a pending non-blocking connect once the socket reports
    /// writable (spec §4.3): `SO_ERROR` distinguishes success from the
    /// connection having actually failed.
    pub fn poll_connect(&mut self) -> Result<ErrorKind> {
        match self.socket.take_error()? {
            None => {
                self.connecting = false;
                Ok(ErrorKind::Ok)
            }
            Some(err) => Err(err.into()),
        }
    }

    /// One non-blocking `read` attempt into `req`'s buffer, resuming from
    /// `req.used` (spec §4.2/§4.3's "resume rather than restart").
    pub fn read_into(&self, req: &mut Request) -> Result<ErrorKind> {
        let slice = req.writable_slice();
        if slice.is_empty() {
            return Ok(ErrorKind::Ok);
        }
        match (&self.socket.inner).read(slice) {
            Ok(0) => Ok(ErrorKind::NoReadable), // peer shutdown
            Ok(n) => {
                req.used += n;
                Ok(ErrorKind::Ok)
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(ErrorKind::Retry),
            Err(err) => Err(err.into()),
        }
    }

    /// One non-blocking `write` attempt of `req`'s unsent tail. A
    /// partial write (`n` short of the full tail, always possible for
    /// TCP) reports `Retry` rather than `Ok` so the caller re-queues
    /// this request instead of firing its callback early (spec §7:
    /// partial success is reported only once every byte is sent).
    pub fn write_from(&self, req: &mut Request) -> Result<ErrorKind> {
        let slice = req.unsent_slice();
        if slice.is_empty() {
            return Ok(ErrorKind::Ok);
        }
        match (&self.socket.inner).write(slice) {
            Ok(n) => {
                req.used += n;
                if req.used < req.buf.len() {
                    Ok(ErrorKind::Retry)
                } else {
                    Ok(ErrorKind::Ok)
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(ErrorKind::Retry),
            Err(err) => Err(err.into()),
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        use std::net::Shutdown;
        match self.socket.inner.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
