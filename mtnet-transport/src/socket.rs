//! Non-blocking TCP socket transport.
//!
//! Owns the descriptor, the outbound byte buffer, the optional SOCKS5
//! handshake and the idle-timeout clock. Everything above it sees a plain
//! duplex byte channel: readiness is handled here, results surface as
//! [`SocketEvent`] values for the owning connection to absorb.
//!
//! All failure paths funnel through [`SocketTransport::close`], which is
//! idempotent — closing an already-closed socket does nothing and the
//! `Closed` event is emitted exactly once per open.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::errors::DisconnectReason;
use crate::reactor::{Reactor, ReadinessSource};
use crate::socks5::{HandshakeStep, ProxyHandshake, Socks5Config};

/// Idle timeout applied when the owner does not override it.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(12);

const READ_CHUNK: usize = 32 * 1024;

/// What happened on the socket, for the owning connection to absorb.
#[derive(Debug)]
pub enum SocketEvent {
    /// The byte channel is up: TCP connected and any proxy handshake done.
    Connected,
    /// A chunk of raw inbound bytes.
    Data(Vec<u8>),
    /// The socket closed. Emitted exactly once per open.
    Closed {
        /// Why it closed.
        reason: DisconnectReason,
        /// Raw OS error code, 0 when there is none.
        code: i32,
    },
}

struct ActiveSocket {
    stream: TcpStream,
    token: Token,
    /// The non-blocking connect has not been confirmed yet.
    connect_pending: bool,
    /// `Connected` has been emitted.
    channel_ready: bool,
    interest: Interest,
}

enum ConnectProgress {
    Pending,
    Done,
    Failed(i32),
}

/// A non-blocking TCP byte channel with optional SOCKS5 tunnelling.
pub struct SocketTransport {
    tag: ReadinessSource,
    active: Option<ActiveSocket>,
    handshake: Option<ProxyHandshake>,
    out_buf: Vec<u8>,
    read_buf: Vec<u8>,
    idle_timeout: Duration,
    last_activity: Instant,
}

impl SocketTransport {
    pub fn new(tag: ReadinessSource) -> Self {
        Self {
            tag,
            active: None,
            handshake: None,
            out_buf: Vec::new(),
            read_buf: vec![0u8; READ_CHUNK],
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            last_activity: Instant::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// True once `Connected` has been emitted for the current open.
    pub fn is_channel_ready(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.channel_ready)
    }

    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    /// Start a non-blocking connect to `target`, or to the proxy with the
    /// real destination deferred behind the SOCKS5 handshake.
    ///
    /// Errors come back tagged: socket setup and connect failures are
    /// transient, a reactor registration failure is fatal for the
    /// descriptor and must be reported, never retried in a loop.
    pub fn open(
        &mut self,
        reactor: &mut Reactor,
        target: SocketAddr,
        proxy: Option<(SocketAddr, Socks5Config)>,
    ) -> Result<(), (DisconnectReason, io::Error)> {
        debug_assert!(self.active.is_none(), "open on an already-open socket");

        let (connect_addr, handshake) = match proxy {
            Some((proxy_addr, config)) => (proxy_addr, Some(ProxyHandshake::new(config, target))),
            None => (target, None),
        };

        let socket = setup_socket(connect_addr)
            .map_err(|e| (DisconnectReason::ConnectFailed, e))?;

        let interest = Interest::READABLE | Interest::WRITABLE;
        let mut stream = TcpStream::from_std(socket.into());
        let token = reactor
            .register(&mut stream, interest, self.tag)
            .map_err(|e| (DisconnectReason::RegistrationFailed, e))?;

        log::debug!("[socket] connecting to {connect_addr}");
        self.active = Some(ActiveSocket {
            stream,
            token,
            connect_pending: true,
            channel_ready: false,
            interest,
        });
        self.handshake = handshake;
        self.out_buf.clear();
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Queue bytes and flush as much as the socket accepts.
    pub fn write(&mut self, reactor: &mut Reactor, bytes: &[u8], events: &mut Vec<SocketEvent>) {
        if self.active.is_none() {
            log::warn!("[socket] write on a closed socket dropped");
            return;
        }
        self.out_buf.extend_from_slice(bytes);
        self.flush(reactor, events);
    }

    /// Writability: resolve a pending connect, then flush.
    pub fn on_writable(&mut self, reactor: &mut Reactor, events: &mut Vec<SocketEvent>) {
        let was_pending = {
            let Some(active) = self.active.as_mut() else { return };
            active.connect_pending
        };
        if was_pending {
            let progress = {
                let Some(active) = self.active.as_mut() else { return };
                match connect_progress(&active.stream) {
                    ConnectProgress::Done => {
                        active.connect_pending = false;
                        ConnectProgress::Done
                    }
                    other => other,
                }
            };
            match progress {
                ConnectProgress::Pending => return,
                ConnectProgress::Failed(code) => {
                    log::debug!("[socket] connect failed (code {code})");
                    self.close(reactor, DisconnectReason::ConnectFailed, code, events);
                    return;
                }
                ConnectProgress::Done => {
                    self.last_activity = Instant::now();
                    let greeting = self.handshake.as_ref().map(|hs| hs.greeting());
                    match greeting {
                        Some(bytes) => {
                            log::debug!("[socks5] sending method negotiation");
                            self.out_buf.extend_from_slice(&bytes);
                        }
                        None => self.mark_channel_ready(events),
                    }
                }
            }
        }
        self.flush(reactor, events);
    }

    /// Readability: drain the descriptor until a short read or `WouldBlock`.
    ///
    /// While a proxy handshake is in progress, bytes feed the handshake and
    /// never reach the application layer.
    pub fn on_readable(&mut self, reactor: &mut Reactor, events: &mut Vec<SocketEvent>) {
        loop {
            let read_result = match self.active.as_mut() {
                Some(active) if !active.connect_pending => active.stream.read(&mut self.read_buf),
                _ => return,
            };
            match read_result {
                Ok(0) => {
                    self.close(reactor, DisconnectReason::ReadFailed, 0, events);
                    return;
                }
                Ok(n) => {
                    self.last_activity = Instant::now();
                    let chunk = self.read_buf[..n].to_vec();
                    if self.handshake.is_some() {
                        if !self.advance_handshake(reactor, &chunk, events) {
                            return;
                        }
                    } else {
                        events.push(SocketEvent::Data(chunk));
                    }
                    // A short read means the descriptor is drained.
                    if n < self.read_buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let code = e.raw_os_error().unwrap_or(0);
                    log::debug!("[socket] read failed: {e}");
                    self.close(reactor, DisconnectReason::ReadFailed, code, events);
                    return;
                }
            }
        }
        self.update_interest(reactor);
    }

    /// Close the socket if it has been idle past its timeout.
    pub fn check_timeout(&mut self, reactor: &mut Reactor, now: Instant, events: &mut Vec<SocketEvent>) {
        if self.active.is_some() && now.duration_since(self.last_activity) > self.idle_timeout {
            log::debug!("[socket] idle timeout after {:?}", self.idle_timeout);
            self.close(reactor, DisconnectReason::IdleTimeout, 0, events);
        }
    }

    /// The single exit path. Safe to call on an already-closed socket.
    pub fn close(
        &mut self,
        reactor: &mut Reactor,
        reason: DisconnectReason,
        code: i32,
        events: &mut Vec<SocketEvent>,
    ) {
        let Some(mut active) = self.active.take() else { return };
        if let Err(e) = reactor.deregister(&mut active.stream, active.token) {
            log::debug!("[socket] deregister on close: {e}");
        }
        self.handshake = None;
        self.out_buf.clear();
        log::debug!("[socket] closed: {reason} (code {code})");
        events.push(SocketEvent::Closed { reason, code });
    }

    /// Feed handshake bytes; returns false when the socket was closed.
    fn advance_handshake(
        &mut self,
        reactor: &mut Reactor,
        chunk: &[u8],
        events: &mut Vec<SocketEvent>,
    ) -> bool {
        let step = {
            let Some(hs) = self.handshake.as_mut() else { return true };
            hs.feed(chunk)
        };
        match step {
            Ok(HandshakeStep::Send(bytes)) => {
                self.out_buf.extend_from_slice(&bytes);
                if let Some(hs) = self.handshake.as_mut() {
                    hs.on_sent();
                }
                self.flush(reactor, events);
                self.active.is_some()
            }
            Ok(HandshakeStep::Established) => {
                log::debug!("[socks5] tunnel established");
                let remainder = match self.handshake.take() {
                    Some(mut hs) => hs.take_remainder(),
                    None => Vec::new(),
                };
                self.mark_channel_ready(events);
                if !remainder.is_empty() {
                    events.push(SocketEvent::Data(remainder));
                }
                true
            }
            Ok(HandshakeStep::NeedMoreData) => true,
            Err(err) => {
                log::warn!("[socks5] handshake failed: {err}");
                self.close(reactor, DisconnectReason::ProxyHandshake, 0, events);
                false
            }
        }
    }

    fn mark_channel_ready(&mut self, events: &mut Vec<SocketEvent>) {
        if let Some(active) = self.active.as_mut() {
            active.channel_ready = true;
        }
        events.push(SocketEvent::Connected);
    }

    fn flush(&mut self, reactor: &mut Reactor, events: &mut Vec<SocketEvent>) {
        loop {
            if self.out_buf.is_empty() {
                break;
            }
            let write_result = match self.active.as_mut() {
                Some(active) => active.stream.write(&self.out_buf),
                None => return,
            };
            match write_result {
                Ok(0) => {
                    self.close(reactor, DisconnectReason::WriteFailed, 0, events);
                    return;
                }
                Ok(n) => {
                    self.out_buf.drain(..n);
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let code = e.raw_os_error().unwrap_or(0);
                    log::debug!("[socket] write failed: {e}");
                    self.close(reactor, DisconnectReason::WriteFailed, code, events);
                    return;
                }
            }
        }
        self.update_interest(reactor);
    }

    /// Writability interest stays armed only while there is unflushed data
    /// or the channel is not up yet; otherwise reads alone are enough.
    fn update_interest(&mut self, reactor: &mut Reactor) {
        let want_writable = !self.out_buf.is_empty()
            || self.active.as_ref().is_some_and(|a| !a.channel_ready);
        let Some(active) = self.active.as_mut() else { return };
        let interest = if want_writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if interest == active.interest {
            return;
        }
        match reactor.reregister(&mut active.stream, active.token, interest) {
            Ok(()) => active.interest = interest,
            Err(e) => log::warn!("[socket] reregister failed: {e}"),
        }
    }
}

fn setup_socket(connect_addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(connect_addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    match socket.connect(&connect_addr.into()) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e),
    }
    Ok(socket)
}

fn connect_progress(stream: &TcpStream) -> ConnectProgress {
    match stream.take_error() {
        Ok(Some(err)) | Err(err) => {
            return ConnectProgress::Failed(err.raw_os_error().unwrap_or(0));
        }
        Ok(None) => {}
    }
    match stream.peer_addr() {
        Ok(_) => ConnectProgress::Done,
        Err(e)
            if e.kind() == io::ErrorKind::NotConnected
                || e.raw_os_error() == Some(libc::EINPROGRESS) =>
        {
            ConnectProgress::Pending
        }
        Err(e) => ConnectProgress::Failed(e.raw_os_error().unwrap_or(0)),
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS)
}
