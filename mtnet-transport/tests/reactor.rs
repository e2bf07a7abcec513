use std::io::Write;
use std::net::TcpListener;
use std::time::{Duration, Instant};

use mio::Interest;
use mio::net::TcpStream;

use mtnet_transport::connection::ConnectionKind;
use mtnet_transport::manager::ConnectionKey;
use mtnet_transport::reactor::{Reactor, ReadinessSource};

fn key() -> ConnectionKey {
    ConnectionKey { datacenter_id: 2, kind: ConnectionKind::Generic, slot: 0 }
}

#[test]
fn waker_interrupts_a_long_wait() {
    let mut reactor = Reactor::new().unwrap();
    let waker = reactor.waker();

    let poker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        waker.wake().unwrap();
    });

    let start = Instant::now();
    let sweep = reactor.run_once(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() < Duration::from_secs(2), "wake must cut the wait short");
    assert!(
        sweep
            .wakeups
            .iter()
            .any(|w| w.source == ReadinessSource::Waker),
        "the waker event must be reported"
    );
    poker.join().unwrap();
}

#[test]
fn registered_socket_reports_readability() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut reactor = Reactor::new().unwrap();
    let mut stream = TcpStream::connect(addr).unwrap();
    let token = reactor
        .register(&mut stream, Interest::READABLE | Interest::WRITABLE, ReadinessSource::Connection(key()))
        .unwrap();

    let (mut peer, _) = listener.accept().unwrap();
    peer.write_all(b"ping").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut readable = false;
    while Instant::now() < deadline && !readable {
        let sweep = reactor.run_once(Duration::from_millis(100)).unwrap();
        readable = sweep.wakeups.iter().any(|w| {
            w.readable && matches!(w.source, ReadinessSource::Connection(k) if k == key())
        });
    }
    assert!(readable, "inbound bytes must surface as a readable wakeup");

    reactor.deregister(&mut stream, token).unwrap();
}

#[test]
fn due_timers_fire_during_run_once() {
    let mut reactor = Reactor::new().unwrap();
    let id = reactor
        .timers()
        .schedule_once(Instant::now(), Duration::from_millis(20))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut fired = Vec::new();
    while Instant::now() < deadline && fired.is_empty() {
        fired = reactor.run_once(Duration::from_millis(50)).unwrap().fired;
    }
    assert_eq!(fired, vec![id]);
}

#[test]
fn poll_wait_is_bounded_by_the_nearest_timer() {
    let mut reactor = Reactor::new().unwrap();
    reactor
        .timers()
        .schedule_once(Instant::now(), Duration::from_millis(30))
        .unwrap();

    // Ask for a 5s wait; the timer must bound it to ~30ms.
    let start = Instant::now();
    let _ = reactor.run_once(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
}
