use std::io;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::fifo::FifoBuffer;
use crate::lock;
use crate::net::{SocketHandle, TcpStream};
use crate::notification::{EventKind, Notification};
use crate::observer::{Callback, Observer};
use crate::reactor::Reactor;

pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// A connection handler echoing every received byte back to the peer.
///
/// Bytes flow socket -> `fifo_in` -> `fifo_out` -> socket, bounded by the
/// FIFO capacity per direction. Interest tracks the FIFOs: when `fifo_in`
/// fills, the Readable observer is withdrawn until the backlog drains;
/// the Writable observer exists only while `fifo_out` holds bytes. That
/// keeps the reactor from signalling readiness the handler cannot act on.
///
/// The handler owns its socket and destroys itself on peer close, on a
/// socket error, or on reactor shutdown: it withdraws its observers,
/// silences its FIFOs, and releases the self-reference that keeps it
/// alive. Observers only hold it weakly, so a dispatch already in flight
/// delivers into a void.
pub struct EchoHandler {
    socket: TcpStream,
    reactor: Arc<Reactor>,
    fifo_in: Arc<FifoBuffer>,
    fifo_out: Arc<FifoBuffer>,
    // self-reference dropped by destroy(); the handler owns itself the
    // way the reactor pattern expects
    anchor: Option<Arc<Mutex<EchoHandler>>>,
}

impl EchoHandler {
    /// Registers an echo handler for `socket` with the default per-
    /// direction buffer size.
    pub fn register(socket: TcpStream, reactor: Arc<Reactor>) -> io::Result<Arc<Mutex<EchoHandler>>> {
        EchoHandler::with_capacity(socket, reactor, DEFAULT_BUFFER_SIZE)
    }

    /// Registers an echo handler buffering up to `capacity` un-echoed
    /// bytes per direction.
    pub fn with_capacity(
        socket: TcpStream,
        reactor: Arc<Reactor>,
        capacity: usize,
    ) -> io::Result<Arc<Mutex<EchoHandler>>> {
        let handle = socket.handle();
        let fifo_in = Arc::new(FifoBuffer::with_notify(capacity, true));
        let fifo_out = Arc::new(FifoBuffer::with_notify(capacity, true));

        let handler = Arc::new(Mutex::new(EchoHandler {
            socket,
            reactor: reactor.clone(),
            fifo_in: fifo_in.clone(),
            fifo_out: fifo_out.clone(),
            anchor: None,
        }));
        lock(&handler).anchor = Some(handler.clone());

        let weak = Arc::downgrade(&handler);

        // fifo_in full <-> not interested in reading the socket
        {
            let weak = weak.clone();
            let reactor = reactor.clone();
            fifo_in.on_writable(move |writable| {
                toggle_observer(
                    &reactor,
                    handle,
                    &weak,
                    EventKind::Readable,
                    EchoHandler::on_socket_readable,
                    writable,
                );
            });
        }

        // fifo_out non-empty <-> interested in writing the socket
        {
            let weak = weak.clone();
            let reactor = reactor.clone();
            fifo_out.on_readable(move |readable| {
                toggle_observer(
                    &reactor,
                    handle,
                    &weak,
                    EventKind::Writable,
                    EchoHandler::on_socket_writable,
                    readable,
                );
            });
        }

        let registered = reactor
            .add_event_handler(
                handle,
                Observer::new(&handler, EventKind::Readable, EchoHandler::on_socket_readable),
            )
            .and_then(|()| {
                reactor.add_event_handler(
                    handle,
                    Observer::new(&handler, EventKind::Shutdown, EchoHandler::on_socket_shutdown),
                )
            });

        if let Err(e) = registered {
            lock(&handler).destroy();
            return Err(e);
        }

        Ok(handler)
    }

    pub fn handle(&self) -> SocketHandle {
        self.socket.handle()
    }

    fn on_socket_readable(&mut self, _nf: &Notification) {
        match self.socket.recv_fifo(&self.fifo_in) {
            Ok(0) => {
                // peer sent FIN
                debug!("peer closed {:?}", self.socket.handle());
                self.destroy();
            }
            Ok(_) => {
                self.pump();
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("read failed on {:?}: {}", self.socket.handle(), e);
                self.destroy();
            }
        }
    }

    fn on_socket_writable(&mut self, _nf: &Notification) {
        match self.socket.send_fifo(&self.fifo_out) {
            Ok(_) => {
                // room just opened downstream; move any backlog along
                self.pump();
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("write failed on {:?}: {}", self.socket.handle(), e);
                self.destroy();
            }
        }
    }

    fn on_socket_shutdown(&mut self, _nf: &Notification) {
        self.destroy();
    }

    /// Moves as much of `fifo_in` as fits into `fifo_out`, draining the
    /// moved prefix.
    fn pump(&self) {
        let fifo_out = &self.fifo_out;
        let _ = self.fifo_in.consume(|queued| Ok(fifo_out.write(queued)));
    }

    /// Withdraws the handler from the reactor and releases the
    /// self-reference. Safe to call more than once.
    fn destroy(&mut self) {
        let Some(anchor) = self.anchor.take() else {
            return;
        };

        // no transition may re-register an observer from here on
        self.fifo_in.set_notify(false);
        self.fifo_out.set_notify(false);

        let weak = Arc::downgrade(&anchor);
        let handle = self.socket.handle();

        let bindings: [(EventKind, Callback<EchoHandler>); 3] = [
            (EventKind::Readable, EchoHandler::on_socket_readable),
            (EventKind::Writable, EchoHandler::on_socket_writable),
            (EventKind::Shutdown, EchoHandler::on_socket_shutdown),
        ];

        for (kind, method) in bindings {
            let observer = Observer::from_weak(weak.clone(), kind, method);
            if let Err(e) = self.reactor.remove_event_handler(handle, &observer) {
                warn!("deregistering {:?} failed: {}", handle, e);
            }
        }

        drop(anchor);
        // the socket closes when the last in-flight reference drops
    }
}

/// Adds or removes one of `handler`'s socket observers as a FIFO crosses a
/// fill-level boundary.
fn toggle_observer(
    reactor: &Arc<Reactor>,
    handle: SocketHandle,
    handler: &Weak<Mutex<EchoHandler>>,
    kind: EventKind,
    method: Callback<EchoHandler>,
    wanted: bool,
) {
    let observer = Observer::from_weak(handler.clone(), kind, method);

    let result = if wanted {
        reactor.add_event_handler(handle, observer)
    } else {
        reactor.remove_event_handler(handle, &observer)
    };

    if let Err(e) = result {
        warn!("adjusting {} interest for {:?} failed: {}", kind, handle, e);
    }
}
