//! SOCKS5 proxy handshake state machine.
//!
//! The transport cannot hand the socket to a blocking SOCKS client — every
//! byte arrives through the reactor — so the negotiation is driven as an
//! explicit state machine over raw reply bytes. While a handshake is in
//! progress the socket's read path feeds bytes here and nothing reaches the
//! application layer; once [`HandshakeState::Established`] is reached the
//! machine is discarded and the socket behaves as if connected directly.
//!
//! Any malformed reply — wrong length, wrong version, unsupported method,
//! non-zero status — fails the handshake with a [`ProxyError`] and the
//! caller closes the socket.

use std::net::SocketAddr;

use crate::errors::ProxyError;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_NONE: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

// ─── Socks5Config ─────────────────────────────────────────────────────────────

/// SOCKS5 proxy endpoint, optional credentials, optional obfuscation secret.
#[derive(Clone, Debug, Default)]
pub struct Socks5Config {
    /// Proxy host — IP literal or hostname (resolved before connecting).
    pub addr: String,
    /// Proxy port.
    pub port: u16,
    /// Username; empty disables authentication.
    pub username: String,
    /// Password.
    pub password: String,
    /// MTProxy-style secret mixed into the obfuscation key derivation.
    pub secret: Option<[u8; 16]>,
}

impl Socks5Config {
    /// An unauthenticated proxy.
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self { addr: addr.into(), port, ..Default::default() }
    }

    /// A proxy requiring username/password authentication.
    pub fn with_auth(
        addr: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            addr: addr.into(),
            port,
            username: username.into(),
            password: password.into(),
            secret: None,
        }
    }

    fn has_auth(&self) -> bool {
        !self.username.is_empty()
    }
}

// ─── Handshake state machine ──────────────────────────────────────────────────

/// Where the negotiation currently is. "Disabled" is represented by the
/// transport holding no handshake at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// Greeting sent, waiting for the method-selection reply.
    AwaitingMethodNegotiation,
    /// Credentials queued on the socket but not yet confirmed written.
    SendingCredentials,
    /// Waiting for the username/password status reply.
    AwaitingCredentialAck,
    /// Connect request queued on the socket.
    SendingConnectRequest,
    /// Waiting for the connect reply.
    AwaitingConnectReply,
    /// Tunnel is up; bytes now belong to the application.
    Established,
}

/// What the transport must do after feeding reply bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Write these bytes to the proxy, then call [`ProxyHandshake::on_sent`].
    Send(Vec<u8>),
    /// The tunnel is established.
    Established,
    /// The reply is incomplete; wait for more bytes.
    NeedMoreData,
}

/// Byte-level SOCKS5 negotiation, one per proxied socket open.
pub struct ProxyHandshake {
    config: Socks5Config,
    target: SocketAddr,
    state: HandshakeState,
    /// Reply bytes accumulated across reads.
    buf: Vec<u8>,
}

impl ProxyHandshake {
    pub fn new(config: Socks5Config, target: SocketAddr) -> Self {
        Self {
            config,
            target,
            state: HandshakeState::AwaitingMethodNegotiation,
            buf: Vec::new(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// The greeting to send as soon as the TCP connect completes.
    pub fn greeting(&self) -> Vec<u8> {
        if self.config.has_auth() {
            vec![SOCKS_VERSION, 2, METHOD_NONE, METHOD_USER_PASS]
        } else {
            vec![SOCKS_VERSION, 1, METHOD_NONE]
        }
    }

    /// Mark queued handshake bytes as handed to the write path, advancing
    /// a `Sending*` state to its matching `Awaiting*` state.
    pub fn on_sent(&mut self) {
        self.state = match self.state {
            HandshakeState::SendingCredentials => HandshakeState::AwaitingCredentialAck,
            HandshakeState::SendingConnectRequest => HandshakeState::AwaitingConnectReply,
            other => other,
        };
    }

    /// Feed reply bytes from the proxy and advance the machine.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<HandshakeStep, ProxyError> {
        self.buf.extend_from_slice(bytes);
        match self.state {
            HandshakeState::AwaitingMethodNegotiation => self.on_method_reply(),
            HandshakeState::AwaitingCredentialAck => self.on_credential_reply(),
            HandshakeState::AwaitingConnectReply => self.on_connect_reply(),
            // Replies arriving while our own bytes are still queued, or
            // after establishment, are out of protocol.
            HandshakeState::SendingCredentials
            | HandshakeState::SendingConnectRequest
            | HandshakeState::Established => Err(ProxyError::BadReplyLength),
        }
    }

    /// Application bytes that arrived glued to the final handshake reply.
    pub fn take_remainder(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    fn on_method_reply(&mut self) -> Result<HandshakeStep, ProxyError> {
        if self.buf.len() < 2 {
            return Ok(HandshakeStep::NeedMoreData);
        }
        if self.buf.len() > 2 {
            return Err(ProxyError::BadReplyLength);
        }
        if self.buf[0] != SOCKS_VERSION {
            return Err(ProxyError::BadVersion);
        }
        let method = self.buf[1];
        self.buf.clear();
        match method {
            METHOD_NONE => {
                self.state = HandshakeState::SendingConnectRequest;
                Ok(HandshakeStep::Send(self.connect_request()))
            }
            METHOD_USER_PASS if self.config.has_auth() => {
                self.state = HandshakeState::SendingCredentials;
                Ok(HandshakeStep::Send(self.credential_request()))
            }
            _ => Err(ProxyError::NoAcceptableMethod),
        }
    }

    fn on_credential_reply(&mut self) -> Result<HandshakeStep, ProxyError> {
        if self.buf.len() < 2 {
            return Ok(HandshakeStep::NeedMoreData);
        }
        if self.buf.len() > 2 {
            return Err(ProxyError::BadReplyLength);
        }
        if self.buf[0] != AUTH_VERSION {
            return Err(ProxyError::BadVersion);
        }
        if self.buf[1] != 0 {
            return Err(ProxyError::AuthRejected);
        }
        self.buf.clear();
        self.state = HandshakeState::SendingConnectRequest;
        Ok(HandshakeStep::Send(self.connect_request()))
    }

    fn on_connect_reply(&mut self) -> Result<HandshakeStep, ProxyError> {
        if self.buf.len() < 4 {
            return Ok(HandshakeStep::NeedMoreData);
        }
        if self.buf[0] != SOCKS_VERSION {
            return Err(ProxyError::BadVersion);
        }
        if self.buf[1] != 0 {
            return Err(ProxyError::ConnectRefused(self.buf[1]));
        }
        let addr_len = match self.buf[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => {
                if self.buf.len() < 5 {
                    return Ok(HandshakeStep::NeedMoreData);
                }
                1 + self.buf[4] as usize
            }
            _ => return Err(ProxyError::BadReplyLength),
        };
        let expected = 4 + addr_len + 2;
        if self.buf.len() < expected {
            return Ok(HandshakeStep::NeedMoreData);
        }
        // Anything past the bound address is application data that arrived
        // glued to the reply; keep it for take_remainder().
        self.buf.drain(..expected);
        self.state = HandshakeState::Established;
        Ok(HandshakeStep::Established)
    }

    fn credential_request(&self) -> Vec<u8> {
        let user = self.config.username.as_bytes();
        let pass = self.config.password.as_bytes();
        let mut out = Vec::with_capacity(3 + user.len() + pass.len());
        out.push(AUTH_VERSION);
        out.push(user.len() as u8);
        out.extend_from_slice(user);
        out.push(pass.len() as u8);
        out.extend_from_slice(pass);
        out
    }

    /// Connect request framing the target with the IPv4/IPv6 address type
    /// matching the resolved address family.
    fn connect_request(&self) -> Vec<u8> {
        let mut out = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
        match self.target {
            SocketAddr::V4(v4) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&v4.ip().octets());
            }
            SocketAddr::V6(v6) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&v6.ip().octets());
            }
        }
        out.extend_from_slice(&self.target.port().to_be_bytes());
        out
    }
}
