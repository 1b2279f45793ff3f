//! Socket abstraction (spec §4.1).
//!
//! Wraps [`socket2::Socket`] — the crate mio's own `net::tcp`/`net::udp`
//! modules depend on for option setting and address conversion — adding
//! the option surface and `SocketPair` helper the spec calls for. The
//! synchronous family (set options, bind, listen, shutdown, blocking
//! send/recv, getpeername/getsockname) lives here; the asynchronous
//! family (`send`, `receive`, `accept`, `connect` against a `Request`)
//! lives in `handle::{stream,datagram,listener}`, which call back into
//! the synchronous primitives here once a poller says the socket is
//! ready.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket as Socket2, Type};

use crate::error::{ErrorKind, ReactorError, Result};

/// IPv4/IPv6 address, sized to hold either, with the canonical `ip:port`
/// text form the spec requires for logging.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct NetAddr(pub SocketAddr);

impl From<SocketAddr> for NetAddr {
    fn from(addr: SocketAddr) -> NetAddr {
        NetAddr(addr)
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0.ip(), self.0.port())
    }
}

impl fmt::Debug for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Keepalive knobs (spec §4.1). The contract is uniform across platforms
/// even where the probe count cannot be set — `set_keepalive` must
/// succeed or return `ReactorError::UnsupportedOption`, never silently
/// degrade.
#[derive(Clone, Copy, Debug)]
pub struct Keepalive {
    pub idle: Duration,
    pub interval: Duration,
    pub retries: u32,
}

fn map_option_err(name: &'static str, err: io::Error) -> ReactorError {
    if err.kind() == io::ErrorKind::Unsupported || err.raw_os_error() == Some(libc::ENOPROTOOPT) {
        ReactorError::UnsupportedOption(name)
    } else {
        err.into()
    }
}

/// Thin wrapper adding the option surface over `socket2::Socket`.
pub struct Socket {
    pub(crate) inner: Socket2,
}

impl Socket {
    pub fn new_tcp(addr: SocketAddr) -> Result<Socket> {
        let domain = Domain::for_address(addr);
        let socket = Socket2::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        Ok(Socket { inner: socket })
    }

    pub fn new_udp(addr: SocketAddr) -> Result<Socket> {
        let domain = Domain::for_address(addr);
        let socket = Socket2::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        Ok(Socket { inner: socket })
    }

    pub fn from_socket2(inner: Socket2) -> Socket {
        Socket { inner }
    }

    /// Adopt an already-open, already-connected descriptor — the shape
    /// `ListenerState::accept` hands back in `req.accept.accepted_fd`
    /// (spec §4.3: accept produces a new handle from the accepted
    /// connection, not just an address).
    #[cfg(unix)]
    pub fn from_raw_fd(fd: std::os::raw::c_int) -> Result<Socket> {
        use std::os::unix::io::FromRawFd;
        // SAFETY: caller passes an fd it just received ownership of from
        // `accept(2)` (via `IntoRawFd` on the accepted peer) and does not
        // use it again afterward.
        let inner = unsafe { Socket2::from_raw_fd(fd) };
        inner.set_nonblocking(true)?;
        Ok(Socket { inner })
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.inner.bind(&addr.into())?;
        Ok(())
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        match self.inner.connect(&addr.into()) {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Backlog is clamped to the OS maximum (spec §4.1).
    pub fn listen(&self, backlog: i32) -> Result<()> {
        let clamped = backlog.clamp(1, libc_somaxconn());
        self.inner.listen(clamped)?;
        Ok(())
    }

    pub fn set_reuse_address(&self, on: bool) -> Result<()> {
        self.inner.set_reuse_address(on)?;
        Ok(())
    }

    #[cfg(unix)]
    pub fn set_reuse_port(&self, on: bool) -> Result<()> {
        self.inner.set_reuse_port(on)?;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn set_reuse_port(&self, _on: bool) -> Result<()> {
        Err(ReactorError::UnsupportedOption("reuse_port"))
    }

    pub fn set_nodelay(&self, on: bool) -> Result<()> {
        self.inner.set_nodelay(on)?;
        Ok(())
    }

    pub fn set_linger(&self, duration: Option<Duration>) -> Result<()> {
        self.inner.set_linger(duration)?;
        Ok(())
    }

    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        self.inner.set_broadcast(on)?;
        Ok(())
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout)?;
        Ok(())
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        self.inner.set_send_buffer_size(size)?;
        Ok(())
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        self.inner.set_recv_buffer_size(size)?;
        Ok(())
    }

    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        self.inner.set_nonblocking(!blocking)?;
        Ok(())
    }

    /// Keepalive must succeed fully or report unsupported — never
    /// silently degrade (spec §4.1).
    pub fn set_keepalive(&self, ka: Keepalive) -> Result<()> {
        let params = socket2::TcpKeepalive::new()
            .with_time(ka.idle)
            .with_interval(ka.interval);
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        let params = params.with_retries(ka.retries);
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        let _ = ka.retries;

        self.inner
            .set_tcp_keepalive(&params)
            .map_err(|e| map_option_err("keepalive", e))?;
        self.inner.set_keepalive(true)?;
        Ok(())
    }

    /// `IP_HDRINCL`: raw-IP-header-inclusion (unix-only, spec §4.1).
    #[cfg(target_os = "linux")]
    pub fn set_header_included(&self, on: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let fd = self.inner.as_raw_fd();
        let value: libc::c_int = on as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_HDRINCL,
                &value as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_header_included(&self, _on: bool) -> Result<()> {
        Err(ReactorError::UnsupportedOption("header_included"))
    }

    /// Promiscuous mode: Linux-only, requires `CAP_NET_RAW` (spec §4.1).
    #[cfg(target_os = "linux")]
    pub fn set_promiscuous(&self, on: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let fd = self.inner.as_raw_fd();
        let mut mreq: libc::packet_mreq = unsafe { std::mem::zeroed() };
        mreq.mr_type = libc::PACKET_MR_PROMISC as u16;
        let level = libc::SOL_PACKET;
        let optname = if on {
            libc::PACKET_ADD_MEMBERSHIP
        } else {
            libc::PACKET_DROP_MEMBERSHIP
        };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                optname,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_promiscuous(&self, _on: bool) -> Result<()> {
        Err(ReactorError::UnsupportedOption("promiscuous"))
    }

    pub fn local_addr(&self) -> Result<NetAddr> {
        let addr = self.inner.local_addr()?;
        Ok(NetAddr(addr.as_socket().ok_or(ReactorError::Kind {
            kind: ErrorKind::InvalidParam,
        })?))
    }

    pub fn peer_addr(&self) -> Result<NetAddr> {
        let addr = self.inner.peer_addr()?;
        Ok(NetAddr(addr.as_socket().ok_or(ReactorError::Kind {
            kind: ErrorKind::InvalidParam,
        })?))
    }

    pub fn take_error(&self) -> Result<Option<io::Error>> {
        Ok(self.inner.take_error()?)
    }

    /// Duplicate the underlying descriptor. Used to hand a write-only
    /// handle to a [`Waker`](crate::loop_::Waker) that outlives the loop's
    /// own borrow of the read half.
    pub fn try_clone(&self) -> Result<Socket> {
        Ok(Socket {
            inner: self.inner.try_clone()?,
        })
    }
}

#[cfg(unix)]
impl std::os::unix::io::AsRawFd for Socket {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(windows)]
impl std::os::windows::io::AsRawSocket for Socket {
    fn as_raw_socket(&self) -> std::os::windows::io::RawSocket {
        self.inner.as_raw_socket()
    }
}

/// Lets a `&Socket` (not just `&socket2::Socket`) feed directly into
/// `channel::send_frame`/`read_into`, which are generic over `Read`/
/// `Write`, the way mio's own `TcpStream` implements both traits.
impl io::Read for &Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }
}

impl io::Write for &Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
fn libc_somaxconn() -> i32 {
    libc::SOMAXCONN
}

#[cfg(not(unix))]
fn libc_somaxconn() -> i32 {
    i32::MAX
}

/// A connected pair of stream sockets (spec §4.1's `SocketPair`), used by
/// the command channel. Prefers a local-domain (`AF_UNIX`) pair; falls
/// back to a loopback listen-and-self-connect dance on platforms without
/// a native `socketpair(2)`.
pub struct SocketPair {
    pub a: Socket,
    pub b: Socket,
}

impl SocketPair {
    #[cfg(unix)]
    pub fn new() -> Result<SocketPair> {
        let (a, b) = Socket2::pair(Domain::UNIX, Type::STREAM, None)?;
        a.set_nonblocking(true)?;
        b.set_nonblocking(true)?;
        Ok(SocketPair {
            a: Socket::from_socket2(a),
            b: Socket::from_socket2(b),
        })
    }

    #[cfg(not(unix))]
    pub fn new() -> Result<SocketPair> {
        let listener = Socket2::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        listener.bind(&loopback.into())?;
        listener.listen(1)?;
        let addr = listener.local_addr()?;

        let client = Socket2::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        client.connect(&addr)?;
        let (server, _) = listener.accept()?;

        client.set_nonblocking(true)?;
        server.set_nonblocking(true)?;
        Ok(SocketPair {
            a: Socket::from_socket2(client),
            b: Socket::from_socket2(server),
        })
    }
}
