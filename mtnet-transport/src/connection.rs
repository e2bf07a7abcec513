//! Framed encrypted connection.
//!
//! The composition root of the transport core: one socket, one session, one
//! framing codec with its pair of keystreams, and the reconnect/backoff
//! lifecycle. The connection is created once per (datacenter, kind, slot)
//! and survives ordinary reconnects — only the socket and keystreams are
//! reset; session state is recreated exclusively through
//! [`Connection::recreate_session`].

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mtnet_crypto::ObfuscatedInit;

use crate::errors::DisconnectReason;
use crate::framing::{FrameCodec, Inbound, ProtocolVariant};
use crate::manager::ConnectionKey;
use crate::reactor::{Reactor, ReadinessSource};
use crate::session::SessionState;
use crate::socket::{SocketEvent, SocketTransport};
use crate::socks5::Socks5Config;

// ─── ConnectionKind ───────────────────────────────────────────────────────────

/// Traffic class a connection carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// RPC traffic and updates.
    Generic,
    /// File download streams.
    Download,
    /// File upload streams.
    Upload,
    /// Long-lived push notification channel.
    Push,
    /// Short-lived auxiliary connections.
    Temp,
}

impl ConnectionKind {
    /// Idle timeout for this kind of traffic.
    pub fn idle_timeout(self) -> Duration {
        match self {
            Self::Generic | Self::Temp => Duration::from_secs(12),
            Self::Download | Self::Upload => Duration::from_secs(25),
            Self::Push => Duration::from_secs(300),
        }
    }
}

// ─── Lifecycle ────────────────────────────────────────────────────────────────

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket and no intent to have one.
    Idle,
    /// TCP connect (and possibly a proxy handshake) underway.
    Connecting,
    /// Channel up, preamble written.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Paused by the owner; session state kept for fast resume.
    Suspended,
}

/// What the connection wants its driver to do or report.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The channel is up.
    Connected,
    /// One complete decrypted inbound frame.
    Received(Vec<u8>),
    /// A quick-ack token from the server.
    QuickAck(u32),
    /// Transient failure; schedule a retry after this delay.
    RetryAfter(Duration),
    /// The connection is down and will not retry on its own.
    Down {
        /// Why it went down.
        reason: DisconnectReason,
        /// Raw OS error code, 0 when there is none.
        code: i32,
    },
}

/// Tuning knobs fixed at connection creation.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionOptions {
    /// Framing variant announced in the preamble.
    pub variant: ProtocolVariant,
    /// Transient failures tolerated before surfacing a hard failure.
    pub max_retries: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self { variant: ProtocolVariant::Intermediate, max_retries: 5 }
    }
}

// ─── Connection ───────────────────────────────────────────────────────────────

/// One pooled connection to a datacenter.
pub struct Connection {
    key: ConnectionKey,
    options: ConnectionOptions,
    socket: SocketTransport,
    session: SessionState,
    codec: Option<FrameCodec>,
    state: ConnectionState,
    target: Option<SocketAddr>,
    proxy: Option<(SocketAddr, Socks5Config)>,
    failed_attempts: u32,
}

impl Connection {
    pub fn new(key: ConnectionKey, options: ConnectionOptions) -> Self {
        let mut socket = SocketTransport::new(ReadinessSource::Connection(key));
        socket.set_idle_timeout(key.kind.idle_timeout());
        Self {
            key,
            options,
            socket,
            session: SessionState::new(),
            codec: None,
            state: ConnectionState::Idle,
            target: None,
            proxy: None,
            failed_attempts: 0,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionState {
        &mut self.session
    }

    /// Throw away sequencing state and draw a fresh session id. Required
    /// when the key or connection identity changes; never done on an
    /// ordinary reconnect.
    pub fn recreate_session(&mut self) {
        self.session.recreate_session();
    }

    /// Start connecting to `target`, optionally through a proxy. The target
    /// is remembered for retries and resume.
    pub fn connect(
        &mut self,
        reactor: &mut Reactor,
        target: SocketAddr,
        proxy: Option<(SocketAddr, Socks5Config)>,
    ) -> Vec<ConnectionEvent> {
        self.target = Some(target);
        self.proxy = proxy.clone();
        self.codec = None;
        self.state = ConnectionState::Connecting;
        log::debug!(
            "[connection] dc{} {:?}#{} connecting to {target}",
            self.key.datacenter_id,
            self.key.kind,
            self.key.slot
        );
        match self.socket.open(reactor, target, proxy) {
            Ok(()) => Vec::new(),
            Err((reason, e)) => {
                log::warn!("[connection] open failed: {e} ({reason})");
                let code = e.raw_os_error().unwrap_or(0);
                if reason == DisconnectReason::RegistrationFailed {
                    // Resource failure: report immediately, no blind retry.
                    self.state = ConnectionState::Idle;
                    return vec![ConnectionEvent::Down { reason, code }];
                }
                self.fail_transient(reason, code)
            }
        }
    }

    /// Dispatch readiness from the reactor.
    pub fn handle_readiness(
        &mut self,
        reactor: &mut Reactor,
        readable: bool,
        writable: bool,
    ) -> Vec<ConnectionEvent> {
        let mut socket_events = Vec::new();
        if writable {
            self.socket.on_writable(reactor, &mut socket_events);
        }
        if readable {
            self.socket.on_readable(reactor, &mut socket_events);
        }
        self.absorb(reactor, socket_events)
    }

    /// Frame, encrypt and queue one application payload.
    ///
    /// `report_ack` asks the server for a quick ack for this frame.
    pub fn send_data(
        &mut self,
        reactor: &mut Reactor,
        payload: &[u8],
        report_ack: bool,
    ) -> Vec<ConnectionEvent> {
        let wire = match self.codec.as_mut() {
            Some(codec) if self.state == ConnectionState::Connected => {
                codec.encode(payload, report_ack)
            }
            _ => {
                log::warn!(
                    "[connection] dc{} send_data while {:?}; dropped",
                    self.key.datacenter_id,
                    self.state
                );
                return Vec::new();
            }
        };
        let mut socket_events = Vec::new();
        self.socket.write(reactor, &wire, &mut socket_events);
        self.absorb(reactor, socket_events)
    }

    /// Pause the connection, keeping session state intact for fast resume.
    pub fn suspend(&mut self, reactor: &mut Reactor) {
        if matches!(self.state, ConnectionState::Suspended | ConnectionState::Idle) {
            return;
        }
        self.state = ConnectionState::Suspended;
        let mut sink = Vec::new();
        self.socket.close(reactor, DisconnectReason::Requested, 0, &mut sink);
        self.codec = None;
        log::debug!("[connection] dc{} {:?} suspended", self.key.datacenter_id, self.key.kind);
    }

    /// Reconnect after a suspension.
    pub fn resume(&mut self, reactor: &mut Reactor) -> Vec<ConnectionEvent> {
        if self.state != ConnectionState::Suspended {
            return Vec::new();
        }
        self.failed_attempts = 0;
        match self.target {
            Some(target) => {
                let proxy = self.proxy.clone();
                self.connect(reactor, target, proxy)
            }
            None => {
                self.state = ConnectionState::Idle;
                Vec::new()
            }
        }
    }

    /// Tear the connection down at the owner's request.
    pub fn shutdown(&mut self, reactor: &mut Reactor) -> Vec<ConnectionEvent> {
        let mut sink = Vec::new();
        self.socket.close(reactor, DisconnectReason::Requested, 0, &mut sink);
        self.codec = None;
        self.state = ConnectionState::Idle;
        vec![ConnectionEvent::Down { reason: DisconnectReason::Requested, code: 0 }]
    }

    /// Close the socket without surfacing anything, e.g. when the proxy
    /// override changes and the driver reconnects immediately.
    pub fn disconnect_quiet(&mut self, reactor: &mut Reactor) {
        let mut sink = Vec::new();
        self.socket.close(reactor, DisconnectReason::Requested, 0, &mut sink);
        self.codec = None;
        if self.state != ConnectionState::Suspended {
            self.state = ConnectionState::Idle;
        }
    }

    /// Idle-timeout sweep, called once per reactor iteration.
    pub fn check_timeout(&mut self, reactor: &mut Reactor, now: Instant) -> Vec<ConnectionEvent> {
        let mut socket_events = Vec::new();
        self.socket.check_timeout(reactor, now, &mut socket_events);
        self.absorb(reactor, socket_events)
    }

    /// Hostname resolution failed; treated like a failed connect.
    pub fn resolve_failed(&mut self) -> Vec<ConnectionEvent> {
        self.fail_transient(DisconnectReason::ResolveFailed, 0)
    }

    fn absorb(
        &mut self,
        reactor: &mut Reactor,
        socket_events: Vec<SocketEvent>,
    ) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        for event in socket_events {
            match event {
                SocketEvent::Connected => self.on_channel_up(reactor, &mut out),
                SocketEvent::Data(chunk) => self.on_inbound(reactor, &chunk, &mut out),
                SocketEvent::Closed { reason, code } => {
                    self.on_socket_closed(reason, code, &mut out)
                }
            }
        }
        out
    }

    /// The byte channel came up: write the preamble and seed both
    /// keystreams. Every reconnect passes through here, so a desynced
    /// stream can never be resumed by accident.
    fn on_channel_up(&mut self, reactor: &mut Reactor, out: &mut Vec<ConnectionEvent>) {
        let secret = self.proxy.as_ref().and_then(|(_, config)| config.secret);
        let init = ObfuscatedInit::generate(
            self.options.variant.tag(),
            self.key.datacenter_id as i16,
            secret.as_ref(),
        );
        let mut sink = Vec::new();
        self.socket.write(reactor, &init.payload, &mut sink);
        self.codec = Some(FrameCodec::new(self.options.variant, init.send, init.recv));
        self.state = ConnectionState::Connected;
        self.failed_attempts = 0;
        log::info!(
            "[connection] dc{} {:?}#{} connected ({:?})",
            self.key.datacenter_id,
            self.key.kind,
            self.key.slot,
            self.options.variant
        );
        out.push(ConnectionEvent::Connected);
        for event in sink {
            if let SocketEvent::Closed { reason, code } = event {
                self.on_socket_closed(reason, code, out);
            }
        }
    }

    fn on_inbound(&mut self, reactor: &mut Reactor, chunk: &[u8], out: &mut Vec<ConnectionEvent>) {
        let decoded = match self.codec.as_mut() {
            Some(codec) => codec.decode(chunk),
            // Bytes can't precede the preamble; nothing to decrypt them with.
            None => return,
        };
        match decoded {
            Ok(units) => {
                for unit in units {
                    match unit {
                        Inbound::Frame(frame) => out.push(ConnectionEvent::Received(frame)),
                        Inbound::QuickAck(ack) => out.push(ConnectionEvent::QuickAck(ack)),
                    }
                }
            }
            Err(err) => {
                log::warn!("[connection] dc{} frame error: {err}", self.key.datacenter_id);
                let mut sink = Vec::new();
                self.socket.close(reactor, DisconnectReason::FrameError, 0, &mut sink);
                for event in sink {
                    if let SocketEvent::Closed { reason, code } = event {
                        self.on_socket_closed(reason, code, out);
                    }
                }
            }
        }
    }

    fn on_socket_closed(
        &mut self,
        reason: DisconnectReason,
        code: i32,
        out: &mut Vec<ConnectionEvent>,
    ) {
        self.codec = None;
        match self.state {
            ConnectionState::Suspended | ConnectionState::Idle => {}
            _ if reason == DisconnectReason::Requested => {
                self.state = ConnectionState::Idle;
            }
            _ => out.extend(self.fail_transient(reason, code)),
        }
    }

    fn fail_transient(&mut self, reason: DisconnectReason, code: i32) -> Vec<ConnectionEvent> {
        self.failed_attempts += 1;
        if self.failed_attempts > self.options.max_retries {
            self.failed_attempts = 0;
            self.state = ConnectionState::Idle;
            log::warn!(
                "[connection] dc{} {:?}#{} giving up after {} attempts: {reason}",
                self.key.datacenter_id,
                self.key.kind,
                self.key.slot,
                self.options.max_retries + 1
            );
            vec![ConnectionEvent::Down { reason: DisconnectReason::RetriesExhausted, code }]
        } else {
            self.state = ConnectionState::Reconnecting;
            let delay = backoff_delay(self.failed_attempts);
            log::debug!(
                "[connection] dc{} {:?}#{} retry {} in {delay:?} after: {reason}",
                self.key.datacenter_id,
                self.key.kind,
                self.key.slot,
                self.failed_attempts
            );
            vec![ConnectionEvent::RetryAfter(delay)]
        }
    }
}

/// Backoff: 1s doubling per attempt, capped at 16s.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs((1u64 << (attempt.min(5) - 1)).min(16))
}
