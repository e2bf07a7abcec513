use std::net::TcpListener;
use std::time::{Duration, Instant};

use mtnet_transport::connection::ConnectionKind;
use mtnet_transport::errors::DisconnectReason;
use mtnet_transport::manager::ConnectionKey;
use mtnet_transport::reactor::{Reactor, ReadinessSource};
use mtnet_transport::socket::{SocketEvent, SocketTransport};

fn key() -> ConnectionKey {
    ConnectionKey { datacenter_id: 1, kind: ConnectionKind::Generic, slot: 0 }
}

fn closed_events(events: &[SocketEvent]) -> Vec<(DisconnectReason, i32)> {
    events
        .iter()
        .filter_map(|e| match e {
            SocketEvent::Closed { reason, code } => Some((*reason, *code)),
            _ => None,
        })
        .collect()
}

#[test]
fn close_twice_emits_exactly_one_closed_event() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut reactor = Reactor::new().unwrap();
    let mut socket = SocketTransport::new(ReadinessSource::Connection(key()));
    let mut events = Vec::new();

    socket.open(&mut reactor, addr, None).unwrap();
    assert!(socket.is_open());

    // A read error and a timeout sweep may both try to close; the second
    // call must be a no-op.
    socket.close(&mut reactor, DisconnectReason::ReadFailed, 0, &mut events);
    socket.close(&mut reactor, DisconnectReason::IdleTimeout, 0, &mut events);

    assert!(!socket.is_open());
    assert_eq!(closed_events(&events), vec![(DisconnectReason::ReadFailed, 0)]);
}

#[test]
fn idle_timeout_closes_and_second_sweep_is_a_noop() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut reactor = Reactor::new().unwrap();
    let mut socket = SocketTransport::new(ReadinessSource::Connection(key()));
    socket.set_idle_timeout(Duration::from_millis(10));

    let mut events = Vec::new();
    socket.open(&mut reactor, addr, None).unwrap();

    let late = Instant::now() + Duration::from_secs(1);
    socket.check_timeout(&mut reactor, late, &mut events);
    socket.check_timeout(&mut reactor, late, &mut events);

    assert_eq!(closed_events(&events), vec![(DisconnectReason::IdleTimeout, 0)]);
}

#[test]
fn connects_and_carries_bytes_both_ways() {
    use std::io::{Read, Write};

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        peer.write_all(b"world").unwrap();
        // Hold the socket open until the client is done reading.
        std::thread::sleep(Duration::from_millis(200));
    });

    let mut reactor = Reactor::new().unwrap();
    let mut socket = SocketTransport::new(ReadinessSource::Connection(key()));
    let mut events = Vec::new();
    socket.open(&mut reactor, addr, None).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut inbound = Vec::new();
    let mut wrote = false;
    while Instant::now() < deadline && inbound.len() < 5 {
        let sweep = reactor.run_once(Duration::from_millis(50)).unwrap();
        for wakeup in sweep.wakeups {
            if matches!(wakeup.source, ReadinessSource::Waker) {
                continue;
            }
            if wakeup.writable {
                socket.on_writable(&mut reactor, &mut events);
            }
            if wakeup.readable {
                socket.on_readable(&mut reactor, &mut events);
            }
        }
        let drained: Vec<SocketEvent> = events.drain(..).collect();
        for event in drained {
            match event {
                SocketEvent::Connected => {
                    socket.write(&mut reactor, b"hello", &mut events);
                    wrote = true;
                }
                SocketEvent::Data(chunk) => inbound.extend_from_slice(&chunk),
                SocketEvent::Closed { reason, code } => {
                    panic!("unexpected close: {reason} (code {code})")
                }
            }
        }
    }

    assert!(wrote, "Connected must fire for a plain (proxy-less) open");
    assert_eq!(inbound, b"world");
    server.join().unwrap();
}
