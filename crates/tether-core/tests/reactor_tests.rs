//! Integration tests driving a single-process reactor through its public
//! interface: listening, connecting, echoing and timers.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{
    Address, CloseReason, Handler, Io, ListenOptions, Protocol, Reactor, TetherConfig,
};

struct Echo {
    closed: Arc<AtomicUsize>,
}

impl Handler for Echo {
    fn on_data(&self, _reactor: &mut Reactor, io: &Io) {
        let mut data = Vec::new();
        while io.read_into(&mut data) > 0 {}
        if !data.is_empty() {
            io.write(data);
        }
    }

    fn on_close(&self, _reactor: &mut Reactor, _io: &Io, _udata: Option<tether_core::reactor::Udata>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn echo_protocol() -> (Arc<Protocol>, Arc<AtomicUsize>) {
    let closed = Arc::new(AtomicUsize::new(0));
    let protocol = Protocol::builder(Echo {
        closed: closed.clone(),
    })
    .build();
    (protocol, closed)
}

/// Run reactor cycles until `read` collected `want` bytes.
fn echo_round_trip(reactor: &mut Reactor, client: &mut impl Read, want: usize) -> Vec<u8> {
    let mut got = Vec::new();
    let mut buf = [0u8; 256];
    for _ in 0..400 {
        reactor.run_once(5).unwrap();
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => got.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => panic!("client read failed: {}", e),
        }
        if got.len() >= want {
            break;
        }
    }
    got
}

#[test]
fn test_unix_echo() {
    let dir = tempfile::tempdir().unwrap();
    let address = Address::Unix(dir.path().join("echo.sock"));
    let mut reactor = Reactor::new(TetherConfig::default()).unwrap();
    let (protocol, closed) = echo_protocol();
    let listener = reactor
        .listen(&address, protocol, ListenOptions::default())
        .unwrap();
    assert_eq!(reactor.listener_address(&listener), Some(address.clone()));

    let Address::Unix(path) = &address else {
        unreachable!()
    };
    let mut client = UnixStream::connect(path).unwrap();
    client.set_nonblocking(true).unwrap();
    client.write_all(b"hello reactor").unwrap();
    assert_eq!(echo_round_trip(&mut reactor, &mut client, 13), b"hello reactor");

    drop(client);
    for _ in 0..100 {
        if closed.load(Ordering::SeqCst) == 1 {
            break;
        }
        reactor.run_once(5).unwrap();
    }
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    reactor.close_now(&listener);
    assert_eq!(listener.close_reason(), Some(CloseReason::Local));
}

#[test]
fn test_tcp_echo_on_ephemeral_port() {
    let mut reactor = Reactor::new(TetherConfig::default()).unwrap();
    let (protocol, _closed) = echo_protocol();
    let listener = reactor
        .listen(
            &Address::parse("tcp://127.0.0.1:0").unwrap(),
            protocol,
            ListenOptions::default(),
        )
        .unwrap();
    let Some(Address::Tcp(bound)) = reactor.listener_address(&listener) else {
        panic!("listener has no tcp address");
    };
    assert_ne!(bound.port(), 0);

    let mut client = TcpStream::connect(bound).unwrap();
    client.set_nonblocking(true).unwrap();
    client.write_all(b"over tcp").unwrap();
    assert_eq!(echo_round_trip(&mut reactor, &mut client, 8), b"over tcp");
}

#[test]
fn test_connect_failure_is_reported() {
    let mut reactor = Reactor::new(TetherConfig::default()).unwrap();
    let (protocol, _closed) = echo_protocol();
    let failures = Arc::new(Mutex::new(Vec::new()));
    let seen = failures.clone();
    reactor
        .connect(
            &Address::parse("/nonexistent/tether-test.sock").unwrap(),
            protocol,
            None,
            Some(Box::new(move |_, err| seen.lock().unwrap().push(err.to_string()))),
        )
        .unwrap();
    assert_eq!(failures.lock().unwrap().len(), 1);
}

#[test]
fn test_timers_run_in_order() {
    let mut reactor = Reactor::new(TetherConfig::default()).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    for (delay, tag) in [(30u64, "late"), (1, "early")] {
        let order = order.clone();
        reactor.run_after(Duration::from_millis(delay), move |_| {
            order.lock().unwrap().push(tag)
        });
    }
    assert_eq!(reactor.timer_count(), 2);
    for _ in 0..100 {
        if order.lock().unwrap().len() == 2 {
            break;
        }
        reactor.run_once(5).unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
    assert_eq!(reactor.timer_count(), 0);
}

#[test]
fn test_deferred_work_from_another_thread() {
    let mut reactor = Reactor::new(TetherConfig::default()).unwrap();
    let handle = reactor.handle();
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    let worker = std::thread::spawn(move || {
        handle.defer(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        handle.stop();
    });
    worker.join().unwrap();
    reactor.run_once(1_000).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(reactor.handle().is_stopping());
}
