use std::fmt;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, error, trace, warn};

use crate::lock;
use crate::net::SocketHandle;
use crate::notification::{EventKind, Notification};
use crate::notifier::SocketNotifier;
use crate::observer::{Observer, SocketObserver};
use crate::pollset::PollSet;
use crate::ready::Ready;
use crate::sys::eventfd::EventFd;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

/// Interrupts a sleeping poll from another thread.
///
/// An eventfd registered as a permanently readable source; the reactor
/// drains it and skips dispatch for it.
#[derive(Debug)]
pub(crate) struct Waker {
    inner: EventFd,
}

impl Waker {
    fn new() -> io::Result<Waker> {
        Ok(Waker {
            inner: EventFd::new()?,
        })
    }

    fn handle(&self) -> SocketHandle {
        SocketHandle::from_raw(self.inner.as_raw_fd())
    }

    fn wake(&self) -> io::Result<()> {
        match self.inner.write(1) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn drain(&self) {
        // empty the counter so the level-triggered source goes quiet
        loop {
            match self.inner.read() {
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    }
}

/// The single-threaded dispatch loop at the heart of the server.
///
/// A reactor owns a [`PollSet`] and a per-socket [`SocketNotifier`] map.
/// [`run`](Reactor::run) polls for readiness, classifies each socket's
/// mode bits in read, write, error order, and dispatches the matching
/// notification through the socket's notifier. Handlers run on the polling
/// thread and must not block it; they may freely add and remove observers,
/// including their own, from inside a callback.
///
/// For every socket with a notifier, the poll set holds an interest mask
/// equal to the mask derived from that notifier's accepted events;
/// [`add_event_handler`](Reactor::add_event_handler) and
/// [`remove_event_handler`](Reactor::remove_event_handler) maintain this.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::thread;
///
/// use echo_reactor::{EchoHandler, Reactor, SocketAcceptor, TcpListener, TcpStream};
///
/// let listener = TcpListener::bind("127.0.0.1:8080").unwrap();
/// let reactor = Arc::new(Reactor::new().unwrap());
///
/// let _acceptor = SocketAcceptor::register(
///     listener,
///     reactor.clone(),
///     |socket: TcpStream, reactor: &Arc<Reactor>| {
///         let _ = EchoHandler::register(socket, reactor.clone());
///     },
/// )
/// .unwrap();
///
/// let runner = reactor.clone();
/// let thread = thread::spawn(move || runner.run());
///
/// // ... until shutdown:
/// reactor.stop();
/// thread.join().unwrap();
/// ```
pub struct Reactor {
    stop: AtomicBool,
    timeout: Mutex<Duration>,
    poll_set: PollSet,
    handlers: Mutex<IndexMap<SocketHandle, Arc<SocketNotifier>>>,
    waker: Waker,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        let poll_set = PollSet::new()?;
        let waker = Waker::new()?;

        poll_set.add(waker.handle(), Ready::readable())?;

        Ok(Reactor {
            stop: AtomicBool::new(false),
            timeout: Mutex::new(DEFAULT_TIMEOUT),
            poll_set,
            handlers: Mutex::new(IndexMap::new()),
            waker,
        })
    }

    /// The poll quantum: how long one cycle waits for readiness, and the
    /// worst-case latency of [`stop`](Reactor::stop) and wake-up.
    pub fn timeout(&self) -> Duration {
        *lock(&self.timeout)
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *lock(&self.timeout) = timeout;
    }

    /// Runs the dispatch loop on the calling thread until
    /// [`stop`](Reactor::stop). Failures inside the loop, including
    /// panicking handlers, are contained; only a fatal poll error ends the
    /// loop early, and either way `Shutdown` is dispatched to every
    /// registered socket on the way out.
    pub fn run(&self) {
        debug!("reactor running");

        while !self.stop.load(Ordering::SeqCst) {
            let timeout = self.timeout();

            if !self.has_socket_handlers() {
                self.on_idle();
                thread::sleep(timeout);
                continue;
            }

            let sm = match self.poll_set.poll(Some(timeout)) {
                Ok(sm) => sm,
                Err(e) => {
                    error!("poll failed, shutting down reactor: {}", e);
                    self.stop.store(true, Ordering::SeqCst);
                    break;
                }
            };

            if sm.is_empty() {
                self.on_timeout();
                continue;
            }

            // a cycle woken only by the wake-up source is neither busy nor
            // a timeout; it just reaches the stop check sooner
            let mut dispatched = false;
            let mut readable = false;

            for (socket, mode) in &sm {
                if *socket == self.waker.handle() {
                    self.waker.drain();
                    continue;
                }

                if !dispatched {
                    dispatched = true;
                    self.on_busy();
                }

                if mode.is_readable() {
                    self.dispatch_socket(*socket, EventKind::Readable);
                    readable = true;
                }
                if mode.is_writable() {
                    self.dispatch_socket(*socket, EventKind::Writable);
                }
                if mode.is_error() {
                    self.dispatch_socket(*socket, EventKind::Error);
                }
            }

            if dispatched && !readable {
                self.on_timeout();
            }
        }

        self.on_shutdown();
        debug!("reactor stopped");
    }

    /// Requests the loop to exit. The in-flight poll cycle is woken; `run`
    /// returns after dispatching `Shutdown`.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("stop could not wake the poller: {}", e);
        }
    }

    /// Nudges the poller so sockets registered from other threads are
    /// considered without waiting out the current poll quantum.
    pub fn wake_up(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// Registers `observer` for `socket`, creating the socket's notifier
    /// if needed and updating the kernel interest mask. Adding an observer
    /// equal to one already registered is a no-op.
    pub fn add_event_handler<H>(&self, socket: SocketHandle, observer: Observer<H>) -> io::Result<()>
    where
        H: Send + 'static,
    {
        trace!("add {} handler for {:?}", observer.kind(), socket);

        let notifier = self.make_notifier(socket);

        if !notifier.has_observer(&observer) {
            notifier.add_observer(Arc::new(observer));
        }

        let interest = notifier.interest();
        if !interest.is_empty() {
            self.poll_set.add(socket, interest)?;
        }

        Ok(())
    }

    /// True when an observer equal to `observer` is registered for
    /// `socket`.
    pub fn has_event_handler(&self, socket: SocketHandle, observer: &dyn SocketObserver) -> bool {
        match self.notifier(socket) {
            Some(notifier) => notifier.has_observer(observer),
            None => false,
        }
    }

    /// Removes the observer equal to `observer` from `socket`.
    ///
    /// When it is the socket's last observer, the notifier leaves the
    /// handler map and the kernel registration is dropped *before* the
    /// observer is disabled: a dispatch racing with removal can no longer
    /// find the notifier, and a dispatch already holding a snapshot finds
    /// the observer disabled.
    pub fn remove_event_handler<H>(
        &self,
        socket: SocketHandle,
        observer: &Observer<H>,
    ) -> io::Result<()>
    where
        H: Send + 'static,
    {
        trace!("remove {} handler for {:?}", observer.kind(), socket);

        let Some(notifier) = self.notifier(socket) else {
            return Ok(());
        };

        if !notifier.has_observer(observer) {
            return Ok(());
        }

        if notifier.count_observers() == 1 {
            lock(&self.handlers).swap_remove(&socket);
            self.poll_set.remove(socket)?;
            notifier.remove_observer(observer);
        } else {
            notifier.remove_observer(observer);

            let interest = notifier.interest();
            if interest.is_empty() {
                self.poll_set.remove(socket)?;
            } else {
                self.poll_set.update(socket, interest)?;
            }
        }

        Ok(())
    }

    /// True when `socket` currently has a kernel registration.
    pub fn has(&self, socket: SocketHandle) -> bool {
        self.poll_set.has(socket)
    }

    fn notifier(&self, socket: SocketHandle) -> Option<Arc<SocketNotifier>> {
        lock(&self.handlers).get(&socket).cloned()
    }

    fn make_notifier(&self, socket: SocketHandle) -> Arc<SocketNotifier> {
        let mut handlers = lock(&self.handlers);

        if let Some(notifier) = handlers.get(&socket) {
            return notifier.clone();
        }

        let notifier = Arc::new(SocketNotifier::new(socket));
        handlers.insert(socket, notifier.clone());
        notifier
    }

    fn has_socket_handlers(&self) -> bool {
        lock(&self.handlers).values().any(|n| n.accepts_io())
    }

    fn dispatch_socket(&self, socket: SocketHandle, kind: EventKind) {
        let Some(notifier) = self.notifier(socket) else {
            return;
        };

        let nf = Notification::new(self, kind, socket);
        notifier.dispatch(&nf);
    }

    /// Fans `kind` out to every registered socket's notifier. The handler
    /// map is snapshotted under its lock and iterated outside it, so
    /// callbacks may register and unregister freely.
    fn dispatch_all(&self, kind: EventKind) {
        let snapshot: Vec<Arc<SocketNotifier>> = lock(&self.handlers).values().cloned().collect();

        for notifier in snapshot {
            let nf = Notification::new(self, kind, notifier.socket());
            notifier.dispatch(&nf);
        }
    }

    fn on_timeout(&self) {
        self.dispatch_all(EventKind::Timeout);
    }

    fn on_idle(&self) {
        self.dispatch_all(EventKind::Idle);
    }

    fn on_shutdown(&self) {
        self.dispatch_all(EventKind::Shutdown);
    }

    fn on_busy(&self) {}
}

impl fmt::Debug for Reactor {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Reactor")
            .field("stop", &self.stop.load(Ordering::SeqCst))
            .field("handlers", &lock(&self.handlers).len())
            .finish()
    }
}
