//! A reactor-pattern TCP echo server built directly on epoll.
//!
//! The crate couples three pieces: a [`PollSet`] mirroring kernel interest
//! masks against a socket registry, per-socket [`SocketNotifier`]s turning
//! raw readiness bits into typed [`Notification`]s for registered
//! [`Observer`]s, and a [`FifoBuffer`] whose fill-level transitions arm and
//! disarm a socket's read/write interest so the kernel never reports
//! readiness a handler cannot act on.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::thread;
//!
//! use echo_reactor::{EchoHandler, Reactor, SocketAcceptor, TcpListener, TcpStream};
//!
//! let listener = TcpListener::bind("127.0.0.1:8080").unwrap();
//! let reactor = Arc::new(Reactor::new().unwrap());
//!
//! let acceptor = SocketAcceptor::register(
//!     listener,
//!     reactor.clone(),
//!     |socket: TcpStream, reactor: &Arc<Reactor>| {
//!         let _ = EchoHandler::register(socket, reactor.clone());
//!     },
//! )
//! .unwrap();
//!
//! let runner = reactor.clone();
//! let dispatcher = thread::spawn(move || runner.run());
//!
//! // ... block until shutdown is requested, then:
//! reactor.stop();
//! dispatcher.join().unwrap();
//! # drop(acceptor);
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

mod acceptor;
mod buffer;
mod connector;
mod echo;
mod fifo;
mod net;
mod notification;
mod notifier;
mod observer;
mod pollset;
mod reactor;
mod ready;
mod sys;

pub mod app;

pub use acceptor::{HandlerFactory, SocketAcceptor};
pub use buffer::{Buffer, BufferError};
pub use connector::SocketConnector;
pub use echo::{EchoHandler, DEFAULT_BUFFER_SIZE};
pub use fifo::FifoBuffer;
pub use net::{SocketHandle, TcpListener, TcpStream};
pub use notification::{EventKind, EventSet, Notification};
pub use notifier::SocketNotifier;
pub use observer::{Callback, Observer, SocketObserver};
pub use pollset::{PollSet, SocketModeMap};
pub use reactor::Reactor;
pub use ready::Ready;

/// Locks `mutex`, entering it even when poisoned: a panicking observer is
/// contained at the dispatch boundary and must not wedge everything that
/// shares a lock with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
