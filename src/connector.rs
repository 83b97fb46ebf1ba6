use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::acceptor::HandlerFactory;
use crate::lock;
use crate::net::{SocketHandle, TcpStream};
use crate::notification::{EventKind, Notification};
use crate::observer::{Callback, Observer};
use crate::reactor::Reactor;

/// Establishes an outbound connection and hands it to a
/// [`HandlerFactory`] once connected.
///
/// The connector starts a non-blocking connect and watches the socket for
/// Readable, Writable, and Error readiness. The first readiness consults
/// `SO_ERROR`: on success the socket goes to the factory, on failure the
/// connector gives up; either way it unregisters its observers.
pub struct SocketConnector<F: HandlerFactory> {
    socket: Option<TcpStream>,
    handle: SocketHandle,
    reactor: Arc<Reactor>,
    factory: F,
    this: Weak<Mutex<SocketConnector<F>>>,
}

impl<F: HandlerFactory> SocketConnector<F> {
    /// Starts connecting to `addr` and registers the connector on
    /// `reactor`.
    pub fn register(
        addr: &SocketAddr,
        reactor: Arc<Reactor>,
        factory: F,
    ) -> io::Result<Arc<Mutex<SocketConnector<F>>>> {
        let socket = TcpStream::connect_nonblocking(addr)?;
        let handle = socket.handle();

        let connector = Arc::new(Mutex::new(SocketConnector {
            socket: Some(socket),
            handle,
            reactor: reactor.clone(),
            factory,
            this: Weak::new(),
        }));
        lock(&connector).this = Arc::downgrade(&connector);

        let registered = reactor
            .add_event_handler(
                handle,
                Observer::new(&connector, EventKind::Readable, SocketConnector::on_readable),
            )
            .and_then(|()| {
                reactor.add_event_handler(
                    handle,
                    Observer::new(&connector, EventKind::Writable, SocketConnector::on_writable),
                )
            })
            .and_then(|()| {
                reactor.add_event_handler(
                    handle,
                    Observer::new(&connector, EventKind::Error, SocketConnector::on_error),
                )
            });

        if let Err(e) = registered {
            lock(&connector).unregister();
            return Err(e);
        }

        Ok(connector)
    }

    fn on_readable(&mut self, _nf: &Notification) {
        match self.socket_error() {
            Some(err) => {
                warn!("connect to peer failed: {}", err);
                self.unregister();
            }
            None => self.on_connect(),
        }
    }

    fn on_writable(&mut self, _nf: &Notification) {
        match self.socket_error() {
            Some(err) => {
                warn!("connect to peer failed: {}", err);
                self.unregister();
            }
            None => self.on_connect(),
        }
    }

    fn on_error(&mut self, _nf: &Notification) {
        if let Some(err) = self.socket_error() {
            warn!("connect to peer failed: {}", err);
        }
        self.unregister();
    }

    fn on_connect(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };

        debug!("connected to {:?}", socket.peer_addr().ok());
        self.factory.create(socket, &self.reactor);
        self.unregister();
    }

    fn socket_error(&self) -> Option<io::Error> {
        let socket = self.socket.as_ref()?;
        match socket.take_error() {
            Ok(err) => err,
            Err(err) => Some(err),
        }
    }

    fn unregister(&mut self) {
        let bindings: [(EventKind, Callback<SocketConnector<F>>); 3] = [
            (EventKind::Readable, SocketConnector::on_readable),
            (EventKind::Writable, SocketConnector::on_writable),
            (EventKind::Error, SocketConnector::on_error),
        ];

        for (kind, method) in bindings {
            let observer = Observer::from_weak(self.this.clone(), kind, method);
            if let Err(e) = self.reactor.remove_event_handler(self.handle, &observer) {
                warn!("connector unregister failed: {}", e);
            }
        }
        // a failed connect drops the socket here; a successful one has
        // already moved it into the factory
        self.socket = None;
    }
}
