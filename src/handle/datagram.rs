//! Datagram endpoints (spec §3 "Handle" kind `Datagram`, §4.3): connected
//! datagrams behave like streams for read/write; unconnected ones carry a
//! peer address on every operation.

use std::io::{Read, Write};
use std::net::SocketAddr;

use crate::error::{ErrorKind, Result};
use crate::request::Request;
use crate::socket::Socket;

pub struct DatagramState {
    pub socket: Socket,
    pub connected: bool,
}

impl DatagramState {
    pub fn bind(addr: SocketAddr) -> Result<DatagramState> {
        let socket = Socket::new_udp(addr)?;
        socket.bind(addr)?;
        Ok(DatagramState {
            socket,
            connected: false,
        })
    }

    pub fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        self.socket.connect(addr)?;
        self.connected = true;
        Ok(())
    }

    pub fn read(&self, req: &mut Request) -> Result<ErrorKind> {
        let slice = req.writable_slice();
        match (&self.socket.inner).read(slice) {
            Ok(n) => {
                req.used += n;
                Ok(ErrorKind::Ok)
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(ErrorKind::Retry),
            Err(err) => Err(err.into()),
        }
    }

    pub fn write(&self, req: &mut Request) -> Result<ErrorKind> {
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

    /// Unconnected receive: fills `req.accept.remote` with the sender.
    pub fn read_from(&self, req: &mut Request) -> Result<ErrorKind> {
        use std::os::unix::io::AsRawFd;
        let fd = self.socket.inner.as_raw_fd();
        let slice = req.writable_slice();
        let mut from: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut fromlen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd,
                slice.as_mut_ptr() as *mut libc::c_void,
                slice.len(),
                0,
                &mut from as *mut _ as *mut libc::sockaddr,
                &mut fromlen,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return if err.kind() == std::io::ErrorKind::WouldBlock {
                Ok(ErrorKind::Retry)
            } else {
                Err(err.into())
            };
        }
        req.used += n as usize;
        req.accept.remote = sockaddr_to_std(&from);
        Ok(ErrorKind::Ok)
    }

    /// Unconnected send to `req.accept.remote`.
    pub fn write_to(&self, req: &mut Request) -> Result<ErrorKind> {
        use std::os::unix::io::AsRawFd;
        let Some(dest) = req.accept.remote else {
            return Err(ErrorKind::InvalidParam.into());
        };
        let fd = self.socket.inner.as_raw_fd();
        let slice = req.unsent_slice();
        if slice.is_empty() {
            return Ok(ErrorKind::Ok);
        }
        let dest_storage: socket2::SockAddr = dest.into();
        let n = unsafe {
            libc::sendto(
                fd,
                slice.as_ptr() as *const libc::c_void,
                slice.len(),
                0,
                dest_storage.as_ptr(),
                dest_storage.len(),
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return if err.kind() == std::io::ErrorKind::WouldBlock {
                Ok(ErrorKind::Retry)
            } else {
                Err(err.into())
            };
        }
        req.used += n as usize;
        if req.used < req.buf.len() {
            Ok(ErrorKind::Retry)
        } else {
            Ok(ErrorKind::Ok)
        }
    }
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Some(SocketAddr::new(ip.into(), u16::from_be(addr.sin_port)))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Some(SocketAddr::new(ip.into(), u16::from_be(addr.sin6_port)))
        }
        _ => None,
    }
}
