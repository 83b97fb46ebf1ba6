use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::lock;
use crate::net::SocketHandle;
use crate::notification::{EventKind, EventSet, Notification};
use crate::observer::SocketObserver;
use crate::ready::Ready;

/// The observers registered for one socket, plus the set of event kinds
/// they collectively accept.
///
/// The accepted set is kept in lockstep with the observer list; the
/// reactor derives the socket's kernel interest mask from it.
pub struct SocketNotifier {
    socket: SocketHandle,
    inner: Mutex<Inner>,
}

struct Inner {
    observers: Vec<Arc<dyn SocketObserver>>,
    accepted: EventSet,
}

impl Inner {
    fn recompute(&mut self) {
        let mut accepted = EventSet::empty();
        for observer in &self.observers {
            accepted.insert(observer.kind());
        }
        self.accepted = accepted;
    }
}

impl SocketNotifier {
    pub fn new(socket: SocketHandle) -> SocketNotifier {
        SocketNotifier {
            socket,
            inner: Mutex::new(Inner {
                observers: Vec::new(),
                accepted: EventSet::empty(),
            }),
        }
    }

    pub fn socket(&self) -> SocketHandle {
        self.socket
    }

    pub fn add_observer(&self, observer: Arc<dyn SocketObserver>) {
        let mut inner = lock(&self.inner);
        inner.accepted.insert(observer.kind());
        inner.observers.push(observer);
    }

    /// Removes the stored observer equal to `observer`, disables it, and
    /// recomputes the accepted set. Returns whether one was found.
    ///
    /// The observer leaves the list before it is disabled, so a dispatch
    /// racing with removal can never deliver through a disabled-but-listed
    /// observer.
    pub fn remove_observer(&self, observer: &dyn SocketObserver) -> bool {
        let removed = {
            let mut inner = lock(&self.inner);
            let position = inner.observers.iter().position(|o| observer.equals(&**o));
            match position {
                Some(idx) => {
                    let removed = inner.observers.remove(idx);
                    inner.recompute();
                    Some(removed)
                }
                None => None,
            }
        };

        match removed {
            Some(observer) => {
                observer.disable();
                true
            }
            None => false,
        }
    }

    pub fn has_observer(&self, observer: &dyn SocketObserver) -> bool {
        lock(&self.inner)
            .observers
            .iter()
            .any(|o| observer.equals(&**o))
    }

    pub fn count_observers(&self) -> usize {
        lock(&self.inner).observers.len()
    }

    pub fn has_observers(&self) -> bool {
        !lock(&self.inner).observers.is_empty()
    }

    /// Whether any current observer accepts `kind`.
    pub fn accepts(&self, kind: EventKind) -> bool {
        lock(&self.inner).accepted.contains(kind)
    }

    /// Whether any current observer accepts a socket-readiness kind.
    pub fn accepts_io(&self) -> bool {
        !self.interest().is_empty()
    }

    /// The kernel interest mask implied by the accepted set.
    pub fn interest(&self) -> Ready {
        lock(&self.inner).accepted.interest()
    }

    /// Delivers `nf` to a snapshot of the observer list.
    ///
    /// The snapshot is taken under the lock and iterated outside it, so
    /// observers may add or remove observers (including themselves) from
    /// their callbacks. A panicking observer is logged and skipped; it
    /// never interrupts delivery to the rest.
    pub fn dispatch(&self, nf: &Notification<'_>) {
        let snapshot: Vec<Arc<dyn SocketObserver>> = lock(&self.inner).observers.clone();

        for observer in snapshot {
            let result = panic::catch_unwind(AssertUnwindSafe(|| observer.notify(nf)));
            if result.is_err() {
                warn!(
                    "observer for {:?} panicked during {} dispatch",
                    self.socket,
                    nf.kind()
                );
            }
        }
    }
}

impl fmt::Debug for SocketNotifier {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let inner = lock(&self.inner);
        fmt.debug_struct("SocketNotifier")
            .field("socket", &self.socket)
            .field("observers", &inner.observers.len())
            .field("accepted", &inner.accepted)
            .finish()
    }
}
