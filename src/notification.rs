use std::fmt;

use crate::net::SocketHandle;
use crate::reactor::Reactor;
use crate::ready::Ready;

/// The kinds of event a reactor delivers.
///
/// `Readable`, `Writable`, and `Error` report socket readiness; `Timeout`,
/// `Idle`, and `Shutdown` are reactor lifecycle events fanned out to every
/// registered socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Readable,
    Writable,
    Error,
    Timeout,
    Idle,
    Shutdown,
}

impl fmt::Display for EventKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            EventKind::Readable => "readable",
            EventKind::Writable => "writable",
            EventKind::Error => "error",
            EventKind::Timeout => "timeout",
            EventKind::Idle => "idle",
            EventKind::Shutdown => "shutdown",
        };
        write!(fmt, "{}", name)
    }
}

const ACCEPT_READABLE: u8 = 0b0001;
const ACCEPT_WRITABLE: u8 = 0b0010;
const ACCEPT_ERROR: u8 = 0b0100;
const ACCEPT_TIMEOUT: u8 = 0b1000;

/// The set of event kinds a notifier's observers accept.
///
/// Only `Readable`, `Writable`, `Error`, and `Timeout` are tracked; the
/// reactor derives a socket's kernel interest mask from the first three.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet(u8);

impl EventSet {
    pub fn empty() -> EventSet {
        EventSet(0)
    }

    fn bit(kind: EventKind) -> u8 {
        match kind {
            EventKind::Readable => ACCEPT_READABLE,
            EventKind::Writable => ACCEPT_WRITABLE,
            EventKind::Error => ACCEPT_ERROR,
            EventKind::Timeout => ACCEPT_TIMEOUT,
            _ => 0,
        }
    }

    pub fn insert(&mut self, kind: EventKind) {
        self.0 |= EventSet::bit(kind);
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        let bit = EventSet::bit(kind);
        bit != 0 && self.0 & bit != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The kernel interest mask this set implies.
    pub fn interest(&self) -> Ready {
        let mut ready = Ready::empty();
        if self.contains(EventKind::Readable) {
            ready |= Ready::readable();
        }
        if self.contains(EventKind::Writable) {
            ready |= Ready::writable();
        }
        if self.contains(EventKind::Error) {
            ready |= Ready::error();
        }
        ready
    }
}

/// An event delivered to observers: the kind, the socket it concerns, and
/// the reactor that produced it.
///
/// Lifecycle events (`Timeout`, `Idle`, `Shutdown`) are delivered once per
/// registered socket, each carrying that socket.
pub struct Notification<'a> {
    reactor: &'a Reactor,
    kind: EventKind,
    socket: SocketHandle,
}

impl<'a> Notification<'a> {
    pub(crate) fn new(reactor: &'a Reactor, kind: EventKind, socket: SocketHandle) -> Notification<'a> {
        Notification {
            reactor,
            kind,
            socket,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The reactor that dispatched this notification.
    pub fn source(&self) -> &Reactor {
        self.reactor
    }

    pub fn socket(&self) -> SocketHandle {
        self.socket
    }
}

impl fmt::Debug for Notification<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Notification")
            .field("kind", &self.kind)
            .field("socket", &self.socket)
            .finish()
    }
}
