use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use log::trace;

use crate::lock;
use crate::net::SocketHandle;
use crate::ready::Ready;
use crate::sys;

/// Readiness reported by one [`PollSet::poll`] cycle, keyed by socket in
/// kernel-returned order.
pub type SocketModeMap = IndexMap<SocketHandle, Ready>;

const EVENTS_CAPACITY: usize = 1024;

/// Couples a kernel epoll instance to an in-memory socket registry.
///
/// For every socket in the registry there is exactly one kernel
/// registration carrying the same interest mask. The contract is total:
/// `add` of a present socket degrades to `update`, `update` of an absent
/// socket degrades to `add`, and `remove` of an absent socket is a no-op.
///
/// All mutations are serialized by an internal mutex. `poll` holds it only
/// while consulting the registry and assembling the result, never across
/// the kernel wait.
pub struct PollSet {
    inner: Mutex<Inner>,
    // serializes the wait buffer between concurrent pollers
    wait_events: Mutex<sys::epoll::Events>,
}

struct Inner {
    epoll: Arc<sys::epoll::Epoll>,
    sockets: IndexMap<SocketHandle, Ready>,
}

impl PollSet {
    pub fn new() -> io::Result<PollSet> {
        Ok(PollSet {
            inner: Mutex::new(Inner {
                epoll: Arc::new(sys::epoll::Epoll::new()?),
                sockets: IndexMap::new(),
            }),
            wait_events: Mutex::new(sys::epoll::Events::with_capacity(EVENTS_CAPACITY)),
        })
    }

    /// Registers `socket` with `interest`; re-registers if already present.
    pub fn add(&self, socket: SocketHandle, interest: Ready) -> io::Result<()> {
        let mut inner = lock(&self.inner);

        trace!("pollset add {:?} {:?}", socket, interest);

        match inner.epoll.add(socket.raw(), interest) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EEXIST) => {
                inner.epoll.modify(socket.raw(), interest)?;
            }
            Err(e) => return Err(e),
        }

        inner.sockets.insert(socket, interest);
        Ok(())
    }

    /// Changes `socket`'s interest mask; registers it if absent.
    pub fn update(&self, socket: SocketHandle, interest: Ready) -> io::Result<()> {
        let mut inner = lock(&self.inner);

        trace!("pollset update {:?} {:?}", socket, interest);

        match inner.epoll.modify(socket.raw(), interest) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::ENOENT) => {
                inner.epoll.add(socket.raw(), interest)?;
            }
            Err(e) => return Err(e),
        }

        inner.sockets.insert(socket, interest);
        Ok(())
    }

    /// Unregisters `socket`. Removing an absent (or already-closed) socket
    /// is a no-op.
    pub fn remove(&self, socket: SocketHandle) -> io::Result<()> {
        let mut inner = lock(&self.inner);

        trace!("pollset remove {:?}", socket);

        match inner.epoll.delete(socket.raw()) {
            Ok(()) => {}
            Err(ref e)
                if e.raw_os_error() == Some(libc::ENOENT)
                    || e.raw_os_error() == Some(libc::EBADF) => {}
            Err(e) => return Err(e),
        }

        inner.sockets.swap_remove(&socket);
        Ok(())
    }

    pub fn has(&self, socket: SocketHandle) -> bool {
        lock(&self.inner).sockets.contains_key(&socket)
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).sockets.is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).sockets.len()
    }

    /// The interest mask `socket` is currently registered with.
    pub fn interest(&self, socket: SocketHandle) -> Option<Ready> {
        lock(&self.inner).sockets.get(&socket).copied()
    }

    /// Empties the registry and replaces the kernel epoll instance.
    pub fn clear(&self) -> io::Result<()> {
        let mut inner = lock(&self.inner);
        inner.sockets.clear();
        // an in-flight wait keeps the old instance alive through its Arc
        inner.epoll = Arc::new(sys::epoll::Epoll::new()?);
        Ok(())
    }

    /// Waits up to `timeout` (forever when `None`) and returns the readiness
    /// observed per registered socket. An empty registry returns
    /// immediately; an interrupted wait restarts with the timeout intact.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<SocketModeMap> {
        let epoll = {
            let inner = lock(&self.inner);
            if inner.sockets.is_empty() {
                return Ok(SocketModeMap::new());
            }
            inner.epoll.clone()
        };

        let mut events = lock(&self.wait_events);
        loop {
            match epoll.wait(&mut events, timeout) {
                Ok(_) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let inner = lock(&self.inner);
        let mut result = SocketModeMap::new();

        for i in 0..events.len() {
            if let Some((fd, ready)) = events.get(i) {
                let socket = SocketHandle::from_raw(fd);
                if inner.sockets.contains_key(&socket) {
                    *result.entry(socket).or_insert_with(Ready::empty) |= ready;
                }
            }
        }

        Ok(result)
    }
}

impl fmt::Debug for PollSet {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("PollSet")
            .field("sockets", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::PollSet;
    use crate::ready::Ready;
    use crate::sys::eventfd::EventFd;
    use crate::SocketHandle;

    fn handle(efd: &EventFd) -> SocketHandle {
        use std::os::unix::io::AsRawFd;
        SocketHandle::from_raw(efd.as_raw_fd())
    }

    #[test]
    fn add_poll_remove_lifecycle() {
        let set = PollSet::new().unwrap();
        let efd = EventFd::new().unwrap();
        let sock = handle(&efd);

        assert!(set.is_empty());
        set.add(sock, Ready::readable()).unwrap();
        assert!(set.has(sock));

        // not signalled yet
        let sm = set.poll(Some(Duration::from_millis(0))).unwrap();
        assert!(sm.is_empty());

        efd.write(1).unwrap();
        let sm = set.poll(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(sm.len(), 1);
        assert!(sm[&sock].is_readable());

        set.remove(sock).unwrap();
        assert!(!set.has(sock));
        let sm = set.poll(Some(Duration::from_millis(0))).unwrap();
        assert!(sm.is_empty());

        // removing again is a no-op
        set.remove(sock).unwrap();
    }

    #[test]
    fn add_of_present_socket_degrades_to_update() {
        let set = PollSet::new().unwrap();
        let efd = EventFd::new().unwrap();
        let sock = handle(&efd);

        efd.write(1).unwrap();

        set.add(sock, Ready::readable()).unwrap();
        let sm = set.poll(Some(Duration::from_millis(100))).unwrap();
        assert!(sm[&sock].is_readable());

        // second add behaves exactly like update: the mask flips to
        // writable interest only
        set.add(sock, Ready::writable()).unwrap();
        assert_eq!(set.interest(sock), Some(Ready::writable()));

        let sm = set.poll(Some(Duration::from_millis(100))).unwrap();
        let ready = sm[&sock];
        assert!(ready.is_writable());
        assert!(!ready.is_readable());
    }

    #[test]
    fn update_of_absent_socket_registers_it() {
        let set = PollSet::new().unwrap();
        let efd = EventFd::new().unwrap();
        let sock = handle(&efd);

        efd.write(1).unwrap();
        set.update(sock, Ready::readable()).unwrap();
        assert!(set.has(sock));

        let sm = set.poll(Some(Duration::from_millis(100))).unwrap();
        assert!(sm[&sock].is_readable());
    }

    #[test]
    fn clear_replaces_the_kernel_set() {
        let set = PollSet::new().unwrap();
        let efd = EventFd::new().unwrap();
        let sock = handle(&efd);

        efd.write(1).unwrap();
        set.add(sock, Ready::readable()).unwrap();
        set.clear().unwrap();

        assert!(set.is_empty());
        let sm = set.poll(Some(Duration::from_millis(0))).unwrap();
        assert!(sm.is_empty());
    }
}
