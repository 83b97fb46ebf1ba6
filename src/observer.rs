use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::lock;
use crate::notification::{EventKind, Notification};

/// The handler method an [`Observer`] invokes.
pub type Callback<H> = for<'a> fn(&mut H, &Notification<'a>);

/// A callback binding a notifier can hold and dispatch to.
///
/// Each observer accepts exactly one [`EventKind`]; `notify` is expected to
/// drop notifications of any other kind. Implementations must tolerate
/// `disable` racing with `notify` and must not hold internal locks while
/// the user callback runs.
pub trait SocketObserver: Send + Sync {
    /// Delivers `nf` to the bound handler if it is still live and the kind
    /// matches.
    fn notify(&self, nf: &Notification<'_>);

    /// The one event kind this observer accepts.
    fn kind(&self) -> EventKind;

    fn accepts(&self, kind: EventKind) -> bool {
        self.kind() == kind
    }

    /// True when `other` binds the same handler instance and method.
    fn equals(&self, other: &dyn SocketObserver) -> bool;

    /// Detaches the handler; later `notify` calls become no-ops.
    /// Idempotent.
    fn disable(&self);

    fn as_any(&self) -> &dyn Any;
}

/// A typed observer: a weak reference to a shared handler plus the method
/// to call for one accepted event kind.
///
/// The handler is held weakly, so an observer never keeps it alive; once
/// the handler is dropped or the observer is disabled, delivery quietly
/// stops. Two observers are equal when they reference the same handler
/// allocation and bind the same method and kind. Clones preserve identity.
pub struct Observer<H> {
    target: Mutex<Option<Weak<Mutex<H>>>>,
    method: Callback<H>,
    kind: EventKind,
}

impl<H: Send + 'static> Observer<H> {
    pub fn new(handler: &Arc<Mutex<H>>, kind: EventKind, method: Callback<H>) -> Observer<H> {
        Observer::from_weak(Arc::downgrade(handler), kind, method)
    }

    /// Builds an observer without upgrading the handler; used where only a
    /// weak reference is in scope (e.g. a handler constructing observers
    /// for itself).
    pub fn from_weak(handler: Weak<Mutex<H>>, kind: EventKind, method: Callback<H>) -> Observer<H> {
        Observer {
            target: Mutex::new(Some(handler)),
            method,
            kind,
        }
    }

    fn target(&self) -> Option<Weak<Mutex<H>>> {
        lock(&self.target).clone()
    }
}

impl<H: Send + 'static> SocketObserver for Observer<H> {
    fn notify(&self, nf: &Notification<'_>) {
        if nf.kind() != self.kind {
            return;
        }

        // Clone the weak reference under the lock, then release it: the
        // callback may disable this very observer (a handler removing
        // itself) and must not find the lock held.
        let Some(weak) = self.target() else {
            return;
        };
        let Some(handler) = weak.upgrade() else {
            return;
        };

        let mut handler = lock(&handler);
        (self.method)(&mut handler, nf);
    }

    fn kind(&self) -> EventKind {
        self.kind
    }

    fn equals(&self, other: &dyn SocketObserver) -> bool {
        let Some(other) = other.as_any().downcast_ref::<Observer<H>>() else {
            return false;
        };

        if self.kind != other.kind || self.method as usize != other.method as usize {
            return false;
        }

        // Take each side's state separately; locking both at once would
        // order-deadlock against a concurrent reversed comparison.
        let mine = self.target();
        let theirs = other.target();

        match (mine, theirs) {
            (Some(a), Some(b)) => a.ptr_eq(&b),
            _ => false,
        }
    }

    fn disable(&self) {
        *lock(&self.target) = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<H> Clone for Observer<H> {
    fn clone(&self) -> Observer<H> {
        Observer {
            target: Mutex::new(lock(&self.target).clone()),
            method: self.method,
            kind: self.kind,
        }
    }
}

impl<H> fmt::Debug for Observer<H> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Observer")
            .field("kind", &self.kind)
            .field("disabled", &lock(&self.target).is_none())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::{Observer, SocketObserver};
    use crate::notification::EventKind;
    use crate::Notification;

    struct Probe {
        hits: usize,
    }

    impl Probe {
        fn on_readable(&mut self, _nf: &Notification) {
            self.hits += 1;
        }

        fn on_writable(&mut self, _nf: &Notification) {
            self.hits += 100;
        }
    }

    #[test]
    fn equality_is_handler_method_and_kind() {
        let a = Arc::new(Mutex::new(Probe { hits: 0 }));
        let b = Arc::new(Mutex::new(Probe { hits: 0 }));

        let obs = Observer::new(&a, EventKind::Readable, Probe::on_readable);

        let same = Observer::new(&a, EventKind::Readable, Probe::on_readable);
        assert!(obs.equals(&same));

        let other_handler = Observer::new(&b, EventKind::Readable, Probe::on_readable);
        assert!(!obs.equals(&other_handler));

        let other_method = Observer::new(&a, EventKind::Writable, Probe::on_writable);
        assert!(!obs.equals(&other_method));
    }

    #[test]
    fn clone_preserves_identity() {
        let handler = Arc::new(Mutex::new(Probe { hits: 0 }));
        let obs = Observer::new(&handler, EventKind::Readable, Probe::on_readable);
        let copy = obs.clone();

        assert!(obs.equals(&copy));
        assert!(copy.equals(&obs));
    }

    #[test]
    fn notify_filters_kind_and_respects_disable() {
        let reactor = crate::Reactor::new().unwrap();
        let sock = crate::SocketHandle::from_raw(0);

        let handler = Arc::new(Mutex::new(Probe { hits: 0 }));
        let obs = Observer::new(&handler, EventKind::Readable, Probe::on_readable);

        obs.notify(&Notification::new(&reactor, EventKind::Writable, sock));
        assert_eq!(handler.lock().unwrap().hits, 0);

        obs.notify(&Notification::new(&reactor, EventKind::Readable, sock));
        assert_eq!(handler.lock().unwrap().hits, 1);

        obs.disable();
        obs.disable(); // idempotent
        obs.notify(&Notification::new(&reactor, EventKind::Readable, sock));
        assert_eq!(handler.lock().unwrap().hits, 1);

        let probe = Observer::new(&handler, EventKind::Readable, Probe::on_readable);
        assert!(!obs.equals(&probe));
    }

    #[test]
    fn dropped_handler_stops_delivery() {
        let reactor = crate::Reactor::new().unwrap();
        let sock = crate::SocketHandle::from_raw(0);

        let handler = Arc::new(Mutex::new(Probe { hits: 0 }));
        let obs = Observer::new(&handler, EventKind::Readable, Probe::on_readable);

        drop(handler);

        // upgrade fails; the delivery is quietly dropped
        obs.notify(&Notification::new(&reactor, EventKind::Readable, sock));
        assert_eq!(obs.kind(), EventKind::Readable);
    }
}
