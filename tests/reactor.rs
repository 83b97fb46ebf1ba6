use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use echo_reactor::{EventKind, Notification, Observer, Reactor, SocketConnector, TcpListener, TcpStream};

const TICK: Duration = Duration::from_millis(10);
const DEADLINE: Duration = Duration::from_secs(5);

/// Accepts one connection from a non-blocking listener, retrying until it
/// lands.
fn accept_one(listener: &TcpListener) -> TcpStream {
    let deadline = Instant::now() + DEADLINE;
    loop {
        match listener.accept() {
            Ok((stream, _)) => return stream,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "no connection to accept");
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("accept failed: {}", e),
        }
    }
}

fn connected_pair() -> (TcpStream, std::net::TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let server = accept_one(&listener);
    (server, client)
}

fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[derive(Default)]
struct Probe {
    readable: usize,
    writable: usize,
    shutdown: usize,
}

impl Probe {
    fn on_readable(&mut self, _nf: &Notification) {
        self.readable += 1;
    }

    fn on_writable(&mut self, _nf: &Notification) {
        self.writable += 1;
    }

    fn on_shutdown(&mut self, _nf: &Notification) {
        self.shutdown += 1;
    }
}

#[test]
fn readable_only_handler_never_sees_writable_readiness() {
    let reactor = Arc::new(Reactor::new().unwrap());
    reactor.set_timeout(TICK);

    let (server, client) = connected_pair();
    let probe = Arc::new(Mutex::new(Probe::default()));

    reactor
        .add_event_handler(
            server.handle(),
            Observer::new(&probe, EventKind::Readable, Probe::on_readable),
        )
        .unwrap();

    let runner = reactor.clone();
    let dispatcher = thread::spawn(move || runner.run());

    // the connected socket is writable this whole time; with readable-only
    // interest nothing may be delivered
    thread::sleep(TICK * 15);
    {
        let probe = probe.lock().unwrap();
        assert_eq!(probe.readable, 0);
        assert_eq!(probe.writable, 0);
    }

    (&client).write_all(b"x").unwrap();
    assert!(wait_until(|| probe.lock().unwrap().readable > 0));
    assert_eq!(probe.lock().unwrap().writable, 0);

    reactor.stop();
    dispatcher.join().unwrap();
    drop(server);
}

#[test]
fn stop_delivers_shutdown_once_per_notifier() {
    let reactor = Arc::new(Reactor::new().unwrap());
    reactor.set_timeout(TICK);

    let (server_a, _client_a) = connected_pair();
    let (server_b, _client_b) = connected_pair();

    let probe_a = Arc::new(Mutex::new(Probe::default()));
    let probe_b = Arc::new(Mutex::new(Probe::default()));

    for (server, probe) in [(&server_a, &probe_a), (&server_b, &probe_b)] {
        reactor
            .add_event_handler(
                server.handle(),
                Observer::new(probe, EventKind::Readable, Probe::on_readable),
            )
            .unwrap();
        reactor
            .add_event_handler(
                server.handle(),
                Observer::new(probe, EventKind::Shutdown, Probe::on_shutdown),
            )
            .unwrap();
    }

    let runner = reactor.clone();
    let dispatcher = thread::spawn(move || runner.run());
    thread::sleep(TICK * 3);

    let stopped_at = Instant::now();
    reactor.stop();
    dispatcher.join().unwrap();

    // one poll quantum plus dispatch, with generous scheduling slack
    assert!(stopped_at.elapsed() < TICK * 20);

    assert_eq!(probe_a.lock().unwrap().shutdown, 1);
    assert_eq!(probe_b.lock().unwrap().shutdown, 1);
}

/// Removes another handler's observer from inside its own callback.
struct Remover {
    reactor: Arc<Reactor>,
    socket: echo_reactor::SocketHandle,
    victim: Weak<Mutex<Probe>>,
    fired: usize,
}

impl Remover {
    fn on_readable(&mut self, _nf: &Notification) {
        if self.fired == 0 {
            let observer =
                Observer::from_weak(self.victim.clone(), EventKind::Readable, Probe::on_readable);
            self.reactor
                .remove_event_handler(self.socket, &observer)
                .unwrap();
        }
        self.fired += 1;
    }
}

#[test]
fn removal_during_dispatch_silences_the_removed_observer() {
    let reactor = Arc::new(Reactor::new().unwrap());
    reactor.set_timeout(TICK);

    let (server, client) = connected_pair();
    let handle = server.handle();

    let victim = Arc::new(Mutex::new(Probe::default()));
    let remover = Arc::new(Mutex::new(Remover {
        reactor: reactor.clone(),
        socket: handle,
        victim: Arc::downgrade(&victim),
        fired: 0,
    }));

    // the remover is dispatched first: it runs before the victim within
    // the same snapshot, so the victim must never fire
    reactor
        .add_event_handler(
            handle,
            Observer::new(&remover, EventKind::Readable, Remover::on_readable),
        )
        .unwrap();
    reactor
        .add_event_handler(
            handle,
            Observer::new(&victim, EventKind::Readable, Probe::on_readable),
        )
        .unwrap();

    let runner = reactor.clone();
    let dispatcher = thread::spawn(move || runner.run());

    (&client).write_all(b"x").unwrap();
    assert!(wait_until(|| remover.lock().unwrap().fired >= 2));

    reactor.stop();
    dispatcher.join().unwrap();

    assert_eq!(victim.lock().unwrap().readable, 0);
    drop(server);
}

#[test]
fn connector_hands_off_the_connected_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let reactor = Arc::new(Reactor::new().unwrap());
    reactor.set_timeout(TICK);

    let connected = Arc::new(AtomicUsize::new(0));
    let factory = {
        let connected = connected.clone();
        move |socket: TcpStream, _reactor: &Arc<Reactor>| {
            assert!(socket.peer_addr().is_ok());
            connected.fetch_add(1, Ordering::SeqCst);
        }
    };

    let runner = reactor.clone();
    let dispatcher = thread::spawn(move || runner.run());

    let _connector = SocketConnector::register(&addr, reactor.clone(), factory).unwrap();
    let _server_side = accept_one(&listener);

    assert!(wait_until(|| connected.load(Ordering::SeqCst) == 1));

    reactor.stop();
    dispatcher.join().unwrap();
}

#[test]
fn wake_up_is_tolerated_at_any_time() {
    let reactor = Arc::new(Reactor::new().unwrap());
    reactor.set_timeout(TICK);

    reactor.wake_up().unwrap();

    let runner = reactor.clone();
    let dispatcher = thread::spawn(move || runner.run());

    for _ in 0..16 {
        reactor.wake_up().unwrap();
    }

    reactor.stop();
    dispatcher.join().unwrap();
}
