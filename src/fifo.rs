use std::fmt;
use std::io;
use std::sync::Mutex;

use crate::buffer::{Buffer, BufferError};
use crate::lock;

type TransitionHook = Box<dyn Fn(bool) + Send>;

/// A bounded FIFO byte queue with fill-level transition signals.
///
/// The queue lives in a fixed-capacity [`Buffer`]; content occupies
/// `[begin, begin + used)` and is compacted to the front when a write would
/// otherwise wrap. Two hooks report fill-level crossings:
///
/// - readable: `true` on empty -> non-empty, `false` on non-empty -> empty
/// - writable: `true` on full -> non-full, `false` on non-full -> full
///
/// Hooks also fire when the queue enters or leaves the error and EOF
/// states. Each crossing fires exactly once, after the state is already
/// consistent, so a hook observes the post-transition queue. Hooks run with
/// the queue's mutex held and must not call back into the same queue.
///
/// All operations are serialized by an internal mutex; one logical producer
/// and one logical consumer are expected.
///
/// # Examples
///
/// ```
/// use echo_reactor::FifoBuffer;
///
/// let fifo = FifoBuffer::new(4);
/// assert_eq!(fifo.write(b"abcdef"), 4);
///
/// let mut out = [0u8; 4];
/// assert_eq!(fifo.read(&mut out), 4);
/// assert_eq!(&out, b"abcd");
/// ```
pub struct FifoBuffer {
    inner: Mutex<Inner>,
}

struct Inner {
    // capacity is the buffer's full size
    buffer: Buffer<'static>,
    begin: usize,
    used: usize,
    notify: bool,
    eof: bool,
    error: bool,
    readable_hook: Option<TransitionHook>,
    writable_hook: Option<TransitionHook>,
}

impl Inner {
    #[inline]
    fn capacity(&self) -> usize {
        self.buffer.size()
    }

    #[inline]
    fn is_readable(&self) -> bool {
        self.used > 0 && !self.error
    }

    #[inline]
    fn is_writable(&self) -> bool {
        self.used < self.capacity() && !self.error && !self.eof
    }

    /// Moves content to the front so the free region is one contiguous tail.
    fn compact(&mut self) {
        if self.begin != 0 {
            let (begin, used) = (self.begin, self.used);
            self.buffer.as_mut_slice().copy_within(begin..begin + used, 0);
            self.begin = 0;
        }
    }

    /// Fires fill-level crossings between `used_before` and the current
    /// state. Call only after all fields are consistent.
    fn emit(&self, used_before: usize) {
        if !self.notify {
            return;
        }

        if used_before == 0 && self.used > 0 {
            self.fire_readable(true);
        } else if used_before > 0 && self.used == 0 {
            self.fire_readable(false);
        }

        let capacity = self.capacity();
        if used_before == capacity && self.used < capacity {
            self.fire_writable(true);
        } else if used_before < capacity && self.used == capacity {
            self.fire_writable(false);
        }
    }

    fn fire_readable(&self, state: bool) {
        if !self.notify {
            return;
        }
        if let Some(hook) = &self.readable_hook {
            hook(state);
        }
    }

    fn fire_writable(&self, state: bool) {
        if !self.notify {
            return;
        }
        if let Some(hook) = &self.writable_hook {
            hook(state);
        }
    }
}

impl FifoBuffer {
    /// Creates a queue of the given capacity with signals disabled.
    pub fn new(capacity: usize) -> FifoBuffer {
        FifoBuffer::with_notify(capacity, false)
    }

    /// Creates a queue of the given capacity; `notify` arms the transition
    /// hooks.
    pub fn with_notify(capacity: usize, notify: bool) -> FifoBuffer {
        FifoBuffer {
            inner: Mutex::new(Inner {
                buffer: Buffer::new(capacity),
                begin: 0,
                used: 0,
                notify,
                eof: false,
                error: false,
                readable_hook: None,
                writable_hook: None,
            }),
        }
    }

    /// Installs the hook observing empty <-> non-empty crossings.
    pub fn on_readable<F>(&self, hook: F)
    where
        F: Fn(bool) + Send + 'static,
    {
        lock(&self.inner).readable_hook = Some(Box::new(hook));
    }

    /// Installs the hook observing full <-> non-full crossings.
    pub fn on_writable<F>(&self, hook: F)
    where
        F: Fn(bool) + Send + 'static,
    {
        lock(&self.inner).writable_hook = Some(Box::new(hook));
    }

    /// Arms or silences the transition hooks.
    pub fn set_notify(&self, notify: bool) {
        lock(&self.inner).notify = notify;
    }

    pub fn capacity(&self) -> usize {
        lock(&self.inner).capacity()
    }

    /// Bytes currently queued.
    pub fn used(&self) -> usize {
        lock(&self.inner).used
    }

    /// Free space, in bytes.
    pub fn available(&self) -> usize {
        let inner = lock(&self.inner);
        inner.capacity() - inner.used
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).used == 0
    }

    pub fn is_full(&self) -> bool {
        let inner = lock(&self.inner);
        inner.used == inner.capacity()
    }

    pub fn is_readable(&self) -> bool {
        lock(&self.inner).is_readable()
    }

    pub fn is_writable(&self) -> bool {
        lock(&self.inner).is_writable()
    }

    /// False once an error has been recorded with [`set_error`](Self::set_error).
    pub fn is_valid(&self) -> bool {
        !lock(&self.inner).error
    }

    /// True when EOF has been recorded, queued bytes notwithstanding.
    pub fn has_eof(&self) -> bool {
        lock(&self.inner).eof
    }

    /// True when EOF has been recorded and the queue is drained.
    pub fn is_eof(&self) -> bool {
        let inner = lock(&self.inner);
        inner.used == 0 && inner.eof
    }

    /// Copies up to `dst.len()` queued bytes into `dst` without consuming
    /// them. Returns the number copied; 0 when the queue is not readable.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }

        let inner = lock(&self.inner);
        if !inner.is_readable() {
            return 0;
        }

        let n = dst.len().min(inner.used);
        dst[..n].copy_from_slice(&inner.buffer.as_slice()[inner.begin..inner.begin + n]);
        n
    }

    /// Copies up to `dst.len()` queued bytes into `dst` and consumes them.
    /// Returns the number copied; 0 when the queue is not readable.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }

        let mut inner = lock(&self.inner);
        if !inner.is_readable() {
            return 0;
        }

        let used_before = inner.used;
        let n = dst.len().min(inner.used);
        dst[..n].copy_from_slice(&inner.buffer.as_slice()[inner.begin..inner.begin + n]);

        inner.used -= n;
        if inner.used == 0 {
            inner.begin = 0;
        } else {
            inner.begin += n;
        }

        inner.emit(used_before);
        n
    }

    /// Appends up to `available()` bytes of `src`, compacting first if the
    /// tail would wrap. Returns the number written; 0 when the queue is not
    /// writable.
    pub fn write(&self, src: &[u8]) -> usize {
        if src.is_empty() {
            return 0;
        }

        let mut inner = lock(&self.inner);
        if !inner.is_writable() {
            return 0;
        }

        let capacity = inner.capacity();
        if capacity - (inner.begin + inner.used) < src.len() {
            inner.compact();
        }

        let used_before = inner.used;
        let available = capacity - inner.begin - inner.used;
        let n = src.len().min(available);
        let at = inner.begin + inner.used;
        inner.buffer.as_mut_slice()[at..at + n].copy_from_slice(&src[..n]);
        inner.used += n;

        inner.emit(used_before);
        n
    }

    /// Consumes `n` queued bytes; `n == 0` or `n >= used()` empties the
    /// queue.
    pub fn drain(&self, n: usize) {
        let mut inner = lock(&self.inner);
        let used_before = inner.used;

        if n == 0 || n >= inner.used {
            inner.begin = 0;
            inner.used = 0;
        } else {
            inner.begin += n;
            inner.used -= n;
        }

        inner.emit(used_before);
    }

    /// Commits `n` bytes the caller has placed in the free tail region.
    /// Fails with [`BufferError::Overflow`] when `n` exceeds the free space
    /// and with [`BufferError::NotWritable`] on a full, errored, or EOF
    /// queue. Prefer [`produce`](Self::produce), which exposes the tail
    /// region and commits in one step.
    pub fn advance(&self, n: usize) -> Result<(), BufferError> {
        let mut inner = lock(&self.inner);

        if !inner.is_writable() {
            return Err(BufferError::NotWritable);
        }
        if n > inner.capacity() - inner.used {
            return Err(BufferError::Overflow);
        }

        inner.compact();
        let used_before = inner.used;
        inner.used += n;

        inner.emit(used_before);
        Ok(())
    }

    /// Zero-copy fill: compacts, hands the free tail region to `f`, and
    /// commits the count `f` returns. An error from `f` leaves the queue
    /// untouched. Fails with `WouldBlock` when the queue is not writable,
    /// so a 0 return from `f` is never ambiguous with "no room".
    pub fn produce<F>(&self, f: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let mut inner = lock(&self.inner);
        if !inner.is_writable() {
            return Err(BufferError::NotWritable.into());
        }

        inner.compact();
        let used_before = inner.used;
        let capacity = inner.capacity();

        let (used, n) = {
            let used = inner.used;
            let region = &mut inner.buffer.as_mut_slice()[used..capacity];
            let n = f(region)?;
            (used, n.min(capacity - used))
        };
        inner.used = used + n;

        inner.emit(used_before);
        Ok(n)
    }

    /// Zero-copy drain: hands the queued region to `f` and drains the count
    /// `f` returns. An error from `f` leaves the queue untouched. Returns 0
    /// without calling `f` when the queue is not readable.
    pub fn consume<F>(&self, f: F) -> io::Result<usize>
    where
        F: FnOnce(&[u8]) -> io::Result<usize>,
    {
        let mut inner = lock(&self.inner);
        if !inner.is_readable() {
            return Ok(0);
        }

        let used_before = inner.used;
        let n = {
            let region = &inner.buffer.as_slice()[inner.begin..inner.begin + inner.used];
            f(region)?.min(inner.used)
        };

        inner.used -= n;
        if inner.used == 0 {
            inner.begin = 0;
        } else {
            inner.begin += n;
        }

        inner.emit(used_before);
        Ok(n)
    }

    /// Records or clears the error state. Entering the error state empties
    /// the queue and reports readable(false)/writable(false) as applicable;
    /// clearing it reports writable(true) when capacity permits and EOF has
    /// not been reached.
    pub fn set_error(&self, error: bool) {
        let mut inner = lock(&self.inner);

        if error {
            let was_readable = inner.is_readable();
            let was_writable = inner.is_writable();

            inner.error = true;
            inner.used = 0;
            inner.begin = 0;

            if was_readable {
                inner.fire_readable(false);
            }
            if was_writable {
                inner.fire_writable(false);
            }
        } else if inner.error {
            inner.error = false;

            if !inner.eof && inner.used < inner.capacity() {
                inner.fire_writable(true);
            }
        }
    }

    /// Records or clears end-of-file. Queued bytes remain readable;
    /// [`is_eof`](Self::is_eof) turns true once they are drained.
    pub fn set_eof(&self, eof: bool) {
        let mut inner = lock(&self.inner);

        if eof && !inner.eof {
            let was_writable = inner.is_writable();
            inner.eof = true;
            if was_writable {
                inner.fire_writable(false);
            }
        } else if !eof && inner.eof {
            inner.eof = false;
            if inner.is_writable() {
                inner.fire_writable(true);
            }
        }
    }
}

impl fmt::Debug for FifoBuffer {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let inner = lock(&self.inner);
        fmt.debug_struct("FifoBuffer")
            .field("capacity", &inner.capacity())
            .field("used", &inner.used)
            .field("eof", &inner.eof)
            .field("error", &inner.error)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicIsize, Ordering};
    use std::sync::Arc;

    use rand::Rng;

    use super::{BufferError, FifoBuffer};

    #[test]
    fn write_then_read_round_trip() {
        let fifo = FifoBuffer::new(8);

        assert_eq!(fifo.write(b"hello"), 5);
        assert_eq!(fifo.used(), 5);

        let mut out = [0u8; 8];
        assert_eq!(fifo.peek(&mut out), 5);
        assert_eq!(&out[..5], b"hello");
        assert_eq!(fifo.used(), 5);

        assert_eq!(fifo.read(&mut out), 5);
        assert_eq!(&out[..5], b"hello");
        assert_eq!(fifo.used(), 0);
        assert_eq!(fifo.read(&mut out), 0);
    }

    #[test]
    fn write_clamps_to_capacity() {
        let fifo = FifoBuffer::new(4);
        assert_eq!(fifo.write(b"abcdef"), 4);
        assert!(fifo.is_full());
        assert_eq!(fifo.write(b"x"), 0);
    }

    #[test]
    fn partial_read_then_write_compacts() {
        let fifo = FifoBuffer::new(4);
        assert_eq!(fifo.write(b"abcd"), 4);

        let mut out = [0u8; 2];
        assert_eq!(fifo.read(&mut out), 2);
        assert_eq!(&out, b"ab");

        // head sits at offset 2; this write has to compact to fit
        assert_eq!(fifo.write(b"ef"), 2);

        let mut all = [0u8; 4];
        assert_eq!(fifo.read(&mut all), 4);
        assert_eq!(&all, b"cdef");
    }

    #[test]
    fn interleaved_stream_preserves_content() {
        let fifo = FifoBuffer::new(16);
        let mut rng = rand::rng();

        let mut sent = Vec::new();
        let mut received = Vec::new();
        let mut next: u8 = 0;

        for _ in 0..1000 {
            if rng.random_bool(0.5) {
                let n = rng.random_range(0..8);
                let chunk: Vec<u8> = (0..n)
                    .map(|i| (next as usize + i) as u8)
                    .collect();
                let written = fifo.write(&chunk);
                sent.extend_from_slice(&chunk[..written]);
                next = next.wrapping_add(written as u8);
            } else {
                let mut out = [0u8; 8];
                let n = rng.random_range(1..8);
                let read = fifo.read(&mut out[..n]);
                received.extend_from_slice(&out[..read]);
            }
            assert!(fifo.used() <= fifo.capacity());
        }

        let mut out = [0u8; 16];
        loop {
            let n = fifo.read(&mut out);
            if n == 0 {
                break;
            }
            received.extend_from_slice(&out[..n]);
        }

        assert_eq!(sent, received);
    }

    #[test]
    fn transitions_fire_once_per_crossing() {
        let fifo = FifoBuffer::with_notify(4, true);

        // +1 on a `true` signal, -1 on `false`; doubled signals would skew
        // the net counts past +/-1
        let readable = Arc::new(AtomicIsize::new(0));
        let writable = Arc::new(AtomicIsize::new(0));

        {
            let readable = readable.clone();
            fifo.on_readable(move |b| {
                readable.fetch_add(if b { 1 } else { -1 }, Ordering::SeqCst);
            });
        }
        {
            let writable = writable.clone();
            fifo.on_writable(move |b| {
                writable.fetch_add(if b { 1 } else { -1 }, Ordering::SeqCst);
            });
        }

        assert_eq!(fifo.write(b"a"), 1); // readable: 0 -> 1
        assert_eq!(fifo.write(b"b"), 1); // no crossing
        assert_eq!(readable.load(Ordering::SeqCst), 1);
        assert_eq!(writable.load(Ordering::SeqCst), 0);

        assert_eq!(fifo.write(b"cd"), 2); // writable: full
        assert_eq!(writable.load(Ordering::SeqCst), -1);

        let mut out = [0u8; 1];
        assert_eq!(fifo.read(&mut out), 1); // writable: full -> non-full
        assert_eq!(writable.load(Ordering::SeqCst), 0);

        fifo.drain(0); // readable: 1 -> 0
        assert_eq!(readable.load(Ordering::SeqCst), 0);
        assert_eq!(writable.load(Ordering::SeqCst), 0);

        fifo.drain(0); // already empty, no crossing
        assert_eq!(readable.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hooks_observe_post_transition_state() {
        let fifo = Arc::new(FifoBuffer::with_notify(2, true));

        let observed = Arc::new(AtomicIsize::new(-1));
        {
            let observed = observed.clone();
            fifo.on_readable(move |b| {
                observed.store(if b { 1 } else { 0 }, Ordering::SeqCst);
            });
        }

        fifo.write(b"a");
        assert_eq!(observed.load(Ordering::SeqCst), 1);

        fifo.drain(0);
        assert_eq!(observed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn error_empties_and_silences() {
        let fifo = FifoBuffer::with_notify(4, true);

        let readable = Arc::new(AtomicIsize::new(0));
        let writable = Arc::new(AtomicIsize::new(0));
        {
            let readable = readable.clone();
            fifo.on_readable(move |b| {
                readable.fetch_add(if b { 1 } else { -1 }, Ordering::SeqCst);
            });
        }
        {
            let writable = writable.clone();
            fifo.on_writable(move |b| {
                writable.fetch_add(if b { 1 } else { -1 }, Ordering::SeqCst);
            });
        }

        fifo.write(b"ab");
        fifo.set_error(true);

        assert!(!fifo.is_valid());
        assert_eq!(fifo.used(), 0);
        assert_eq!(readable.load(Ordering::SeqCst), 0); // +1 then -1
        assert_eq!(writable.load(Ordering::SeqCst), -1);

        assert_eq!(fifo.write(b"x"), 0);
        let mut out = [0u8; 4];
        assert_eq!(fifo.read(&mut out), 0);

        fifo.set_error(false);
        assert!(fifo.is_valid());
        assert_eq!(writable.load(Ordering::SeqCst), 0); // writable(true) on clear
        assert_eq!(fifo.write(b"x"), 1);
    }

    #[test]
    fn eof_stops_writes_keeps_reads() {
        let fifo = FifoBuffer::new(4);
        fifo.write(b"ab");
        fifo.set_eof(true);

        assert!(!fifo.is_writable());
        assert!(!fifo.is_eof()); // bytes still queued
        assert_eq!(fifo.write(b"x"), 0);

        let mut out = [0u8; 4];
        assert_eq!(fifo.read(&mut out), 2);
        assert!(fifo.is_eof());
    }

    #[test]
    fn advance_commits_tail_bytes() {
        let fifo = FifoBuffer::new(8);
        fifo.write(b"ab");

        let n = fifo
            .produce(|region| {
                region[..3].copy_from_slice(b"cde");
                Ok(3)
            })
            .unwrap();
        assert_eq!(n, 3);

        let mut out = [0u8; 8];
        assert_eq!(fifo.read(&mut out), 5);
        assert_eq!(&out[..5], b"abcde");
    }

    #[test]
    fn advance_overflow_is_rejected() {
        let fifo = FifoBuffer::new(4);
        fifo.write(b"abc");
        assert_eq!(fifo.advance(2), Err(BufferError::Overflow));
        assert_eq!(fifo.advance(1), Ok(()));
        assert_eq!(fifo.used(), 4);
        assert_eq!(fifo.advance(1), Err(BufferError::NotWritable));
    }

    #[test]
    fn produce_on_full_fifo_would_block() {
        let fifo = FifoBuffer::new(2);
        fifo.write(b"ab");
        let err = fifo.produce(|_| Ok(0)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn consume_drains_what_the_closure_takes() {
        let fifo = FifoBuffer::new(8);
        fifo.write(b"abcdef");

        let n = fifo
            .consume(|region| {
                assert_eq!(region, b"abcdef");
                Ok(4)
            })
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(fifo.used(), 2);

        let mut out = [0u8; 2];
        fifo.read(&mut out);
        assert_eq!(&out, b"ef");
    }

    #[test]
    fn consume_error_leaves_queue_untouched() {
        let fifo = FifoBuffer::new(8);
        fifo.write(b"abc");

        let err = fifo.consume::<_>(|_| {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        });
        assert!(err.is_err());
        assert_eq!(fifo.used(), 3);
    }
}
