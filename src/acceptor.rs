use std::io;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::lock;
use crate::net::{TcpListener, TcpStream};
use crate::notification::{EventKind, Notification};
use crate::observer::Observer;
use crate::reactor::Reactor;

/// Builds a connection handler for each socket an acceptor or connector
/// hands over.
///
/// The factory is expected to register the handler's observers with the
/// reactor before returning.
pub trait HandlerFactory: Send + 'static {
    fn create(&mut self, socket: TcpStream, reactor: &Arc<Reactor>);
}

impl<F> HandlerFactory for F
where
    F: FnMut(TcpStream, &Arc<Reactor>) + Send + 'static,
{
    fn create(&mut self, socket: TcpStream, reactor: &Arc<Reactor>) {
        self(socket, reactor)
    }
}

/// Accepts connections on a listening socket and hands each one to a
/// [`HandlerFactory`].
///
/// The acceptor registers itself as the Readable observer of the listening
/// socket. On readiness it accepts one connection, wakes the reactor so
/// the new socket joins the next poll cycle, and invokes the factory.
pub struct SocketAcceptor<F: HandlerFactory> {
    listener: TcpListener,
    reactor: Arc<Reactor>,
    factory: F,
    this: Weak<Mutex<SocketAcceptor<F>>>,
}

impl<F: HandlerFactory> SocketAcceptor<F> {
    /// Registers an acceptor for `listener` on `reactor`.
    ///
    /// The returned handle keeps the acceptor alive; dropping it stops
    /// accepting (call [`unregister`](Self::unregister) first to also
    /// clear the listening socket's registration).
    pub fn register(
        listener: TcpListener,
        reactor: Arc<Reactor>,
        factory: F,
    ) -> io::Result<Arc<Mutex<SocketAcceptor<F>>>> {
        let handle = listener.handle();

        let acceptor = Arc::new(Mutex::new(SocketAcceptor {
            listener,
            reactor: reactor.clone(),
            factory,
            this: Weak::new(),
        }));
        lock(&acceptor).this = Arc::downgrade(&acceptor);

        reactor.add_event_handler(
            handle,
            Observer::new(&acceptor, EventKind::Readable, SocketAcceptor::on_accept),
        )?;

        Ok(acceptor)
    }

    /// Removes the acceptor's observer from the listening socket.
    pub fn unregister(&self) -> io::Result<()> {
        let observer = Observer::from_weak(
            self.this.clone(),
            EventKind::Readable,
            SocketAcceptor::on_accept,
        );
        self.reactor
            .remove_event_handler(self.listener.handle(), &observer)
    }

    fn on_accept(&mut self, nf: &Notification) {
        match self.listener.accept() {
            Ok((socket, peer)) => {
                debug!("accepted connection from {}", peer);
                let _ = nf.source().wake_up();
                self.factory.create(socket, &self.reactor);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("accept failed: {}", e),
        }
    }
}
