use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{self, Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use crate::fifo::FifoBuffer;
use crate::sys::syscall;

/// A non-owning alias for a socket, identified by its descriptor.
///
/// Identity, ordering, and hashing are on the descriptor value. Handles
/// are freely copyable; the descriptor itself has a single owner (the
/// [`TcpStream`] / [`TcpListener`] wrapper) responsible for closing it.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketHandle(RawFd);

impl SocketHandle {
    pub fn from_raw(fd: RawFd) -> SocketHandle {
        SocketHandle(fd)
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "SocketHandle({})", self.0)
    }
}

/// A non-blocking TCP connection.
///
/// Reads and writes return `WouldBlock` instead of blocking; readiness
/// comes from the reactor.
#[derive(Debug)]
pub struct TcpStream {
    inner: net::TcpStream,
}

impl TcpStream {
    pub fn new(stream: net::TcpStream) -> io::Result<TcpStream> {
        stream.set_nonblocking(true)?;

        Ok(TcpStream { inner: stream })
    }

    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<TcpStream> {
        let stream = net::TcpStream::connect(addr)?;

        TcpStream::new(stream)
    }

    /// Starts a non-blocking connect. The returned stream is usually still
    /// connecting; register it for writable readiness to learn the
    /// outcome, then check [`take_error`](Self::take_error).
    pub fn connect_nonblocking(addr: &SocketAddr) -> io::Result<TcpStream> {
        let family = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };

        let fd = syscall!(socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0
        ))?;
        let stream = TcpStream {
            inner: unsafe { net::TcpStream::from_raw_fd(fd) },
        };

        let (storage, len) = sockaddr_from(addr);
        match syscall!(connect(
            fd,
            &storage as *const _ as *const libc::sockaddr,
            len
        )) {
            Ok(_) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }

        Ok(stream)
    }

    pub fn handle(&self) -> SocketHandle {
        SocketHandle(self.inner.as_raw_fd())
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        self.inner.nodelay()
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.inner.set_nonblocking(nonblocking)
    }

    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.inner.set_read_timeout(dur)
    }

    /// Bytes queued in the kernel receive buffer (`FIONREAD`).
    pub fn available(&self) -> io::Result<usize> {
        let mut count: libc::c_int = 0;
        syscall!(ioctl(self.inner.as_raw_fd(), libc::FIONREAD, &mut count))?;
        Ok(count as usize)
    }

    /// Receives directly into `fifo`'s free tail region and commits the
    /// received count. `Ok(0)` means the peer closed its sending half;
    /// `WouldBlock` means no data yet (or no room in `fifo`).
    pub fn recv_fifo(&self, fifo: &FifoBuffer) -> io::Result<usize> {
        fifo.produce(|region| (&self.inner).read(region))
    }

    /// Sends from `fifo`'s queued region and drains the sent count.
    /// Returns `Ok(0)` when `fifo` has nothing to send.
    pub fn send_fifo(&self, fifo: &FifoBuffer) -> io::Result<usize> {
        fifo.consume(|region| (&self.inner).write(region))
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Read for &TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Write for &TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.inner).flush()
    }
}

impl FromRawFd for TcpStream {
    unsafe fn from_raw_fd(fd: RawFd) -> TcpStream {
        TcpStream {
            inner: net::TcpStream::from_raw_fd(fd),
        }
    }
}

impl IntoRawFd for TcpStream {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// A non-blocking TCP listener.
#[derive(Debug)]
pub struct TcpListener {
    inner: net::TcpListener,
}

impl TcpListener {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<TcpListener> {
        let listener = net::TcpListener::bind(addr)?;

        TcpListener::new(listener)
    }

    pub fn new(listener: net::TcpListener) -> io::Result<TcpListener> {
        listener.set_nonblocking(true)?;

        Ok(TcpListener { inner: listener })
    }

    pub fn handle(&self) -> SocketHandle {
        SocketHandle(self.inner.as_raw_fd())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts one pending connection; the returned stream is already
    /// non-blocking. `WouldBlock` when none is pending.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner
            .accept()
            .and_then(|(stream, addr)| Ok((TcpStream::new(stream)?, addr)))
    }
}

impl FromRawFd for TcpListener {
    unsafe fn from_raw_fd(fd: RawFd) -> TcpListener {
        TcpListener {
            inner: net::TcpListener::from_raw_fd(fd),
        }
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};

    use super::{TcpListener, TcpStream};
    use crate::fifo::FifoBuffer;

    #[test]
    fn nonblocking_read_would_block() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = TcpStream::connect(addr).unwrap();
        let mut buf = [0u8; 8];
        let err = (&stream).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn fifo_round_trip_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        };

        (&client).write_all(b"ping").unwrap();

        let fifo = FifoBuffer::new(16);
        let n = loop {
            match server.recv_fifo(&fifo) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("recv failed: {}", e),
            }
        };
        assert_eq!(n, 4);
        assert_eq!(server.available().unwrap(), 0);

        let sent = server.send_fifo(&fifo).unwrap();
        assert_eq!(sent, 4);

        let mut echoed = [0u8; 4];
        let mut client_read = client;
        client_read.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"ping");
    }
}
