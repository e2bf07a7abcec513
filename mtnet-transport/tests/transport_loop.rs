//! End-to-end loopback: a real socket, the full preamble/keystream/framing
//! path, and the orchestrator boundary callbacks.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mtnet_crypto::obfuscation;
use mtnet_crypto::Keystream;
use mtnet_transport::connection::ConnectionKind;
use mtnet_transport::errors::DisconnectReason;
use mtnet_transport::manager::{
    ConnectionKey, Endpoint, TransportContext, TransportDelegate, TransportLoop,
};

#[derive(Debug)]
enum Seen {
    Connected,
    Data(Vec<u8>),
    Disconnected(DisconnectReason, i32),
    QuickAck(u32),
}

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl TransportDelegate for Recorder {
    fn on_connected(&mut self, _key: ConnectionKey) {
        self.seen.lock().unwrap().push(Seen::Connected);
    }
    fn on_disconnected(&mut self, _key: ConnectionKey, reason: DisconnectReason, code: i32) {
        self.seen.lock().unwrap().push(Seen::Disconnected(reason, code));
    }
    fn on_received_data(&mut self, _key: ConnectionKey, data: Vec<u8>) {
        self.seen.lock().unwrap().push(Seen::Data(data));
    }
    fn on_quick_ack(&mut self, _key: ConnectionKey, ack: u32) {
        self.seen.lock().unwrap().push(Seen::QuickAck(ack));
    }
}

fn generic_key() -> ConnectionKey {
    ConnectionKey { datacenter_id: 2, kind: ConnectionKind::Generic, slot: 0 }
}

/// A peer that understands the obfuscated intermediate transport well
/// enough to echo one frame back through the client's receive keystream.
fn echo_server(listener: TcpListener) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();

        let mut init = [0u8; 64];
        peer.read_exact(&mut init).unwrap();
        // The key material rides in the plaintext region (bytes 8..56).
        let (client_send, client_recv) = obfuscation::derive_keys(&init, None);
        let mut from_client = Keystream::new(&client_send.key, &client_send.iv);
        from_client.skip(64);
        let mut to_client = Keystream::new(&client_recv.key, &client_recv.iv);

        let mut head = [0u8; 4];
        peer.read_exact(&mut head).unwrap();
        from_client.apply(&mut head);
        let len = u32::from_le_bytes(head) as usize;
        let mut body = vec![0u8; len];
        peer.read_exact(&mut body).unwrap();
        from_client.apply(&mut body);

        let mut reply = Vec::with_capacity(4 + body.len());
        reply.extend_from_slice(&(body.len() as u32).to_le_bytes());
        reply.extend_from_slice(&body);
        to_client.apply(&mut reply);
        peer.write_all(&reply).unwrap();

        // Give the client time to drain before the socket drops.
        std::thread::sleep(Duration::from_millis(300));
    })
}

fn drive_until<F: FnMut(&[Seen]) -> bool>(
    lp: &mut TransportLoop,
    recorder: &Recorder,
    mut done: F,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        lp.run_iteration(Duration::from_millis(50)).unwrap();
        if done(&recorder.seen.lock().unwrap()) {
            return true;
        }
    }
    false
}

#[test]
fn frames_round_trip_through_a_live_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = echo_server(listener);

    let recorder = Recorder::default();
    let mut lp = TransportLoop::new(TransportContext::default(), Box::new(recorder.clone())).unwrap();
    let handle = lp.handle();

    let key = generic_key();
    handle.open_connection(
        key,
        Endpoint { host: "127.0.0.1".into(), port, prefer_ipv6: false },
    );

    assert!(
        drive_until(&mut lp, &recorder, |seen| {
            seen.iter().any(|s| matches!(s, Seen::Connected))
        }),
        "connection never came up"
    );

    // The orchestrator reaches session bookkeeping through the pool.
    let session = lp.connection_mut(key).unwrap().session_mut();
    assert_ne!(session.session_id(), 0);
    assert_eq!(session.generate_message_seq_no(true), 1);

    let payload = b"echo me through the keystream".to_vec();
    handle.send_data(key, payload.clone(), false);

    assert!(
        drive_until(&mut lp, &recorder, |seen| {
            seen.iter().any(|s| matches!(s, Seen::Data(d) if *d == payload))
        }),
        "echoed frame never decoded back to the original payload"
    );

    server.join().unwrap();
}

#[test]
fn drop_connection_reports_requested_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    // Accept and hold the socket open so the connection establishes.
    let server = std::thread::spawn(move || {
        let (peer, _) = listener.accept().unwrap();
        std::thread::sleep(Duration::from_millis(500));
        drop(peer);
    });

    let recorder = Recorder::default();
    let mut lp = TransportLoop::new(TransportContext::default(), Box::new(recorder.clone())).unwrap();
    let handle = lp.handle();

    let key = generic_key();
    handle.open_connection(
        key,
        Endpoint { host: "127.0.0.1".into(), port, prefer_ipv6: false },
    );
    assert!(drive_until(&mut lp, &recorder, |seen| {
        seen.iter().any(|s| matches!(s, Seen::Connected))
    }));

    handle.drop_connection(key);
    assert!(
        drive_until(&mut lp, &recorder, |seen| {
            seen.iter()
                .any(|s| matches!(s, Seen::Disconnected(DisconnectReason::Requested, 0)))
        }),
        "drop must surface exactly as a requested disconnect"
    );

    server.join().unwrap();
}
