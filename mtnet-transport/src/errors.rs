//! Error types for the transport core.
//!
//! Failures crossing the orchestrator boundary are data — a
//! [`DisconnectReason`] plus a numeric code — never panics. Everything below
//! funnels through the idempotent socket close path, so higher layers never
//! have to distinguish "already closed" from "closing now".

use std::fmt;

// ─── DisconnectReason ─────────────────────────────────────────────────────────

/// Why a connection went down. Delivered to the orchestrator alongside the
/// raw OS error code (0 when there is none).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The owner asked for the connection to be dropped.
    Requested,
    /// No socket activity within the idle-timeout window.
    IdleTimeout,
    /// The TCP connect was refused or failed to complete.
    ConnectFailed,
    /// Hostname resolution failed.
    ResolveFailed,
    /// A read syscall failed or the peer closed the stream.
    ReadFailed,
    /// A write syscall failed.
    WriteFailed,
    /// The SOCKS5 proxy rejected or garbled its handshake.
    ProxyHandshake,
    /// Malformed frame length or keystream desync; never retried in place.
    FrameError,
    /// Registering the descriptor with the reactor failed.
    RegistrationFailed,
    /// The retry budget ran out; surfaced as a hard failure.
    RetriesExhausted,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Requested          => "requested",
            Self::IdleTimeout        => "idle timeout",
            Self::ConnectFailed      => "connect failed",
            Self::ResolveFailed      => "resolve failed",
            Self::ReadFailed         => "read failed",
            Self::WriteFailed        => "write failed",
            Self::ProxyHandshake     => "proxy handshake failed",
            Self::FrameError         => "frame error",
            Self::RegistrationFailed => "reactor registration failed",
            Self::RetriesExhausted   => "retries exhausted",
        };
        f.write_str(name)
    }
}

// ─── ProxyError ───────────────────────────────────────────────────────────────

/// A SOCKS5 reply the handshake state machine refuses to accept.
///
/// Every variant is fatal for the socket: the handshake never retries a
/// malformed exchange in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyError {
    /// Reply length is impossible for the current handshake state.
    BadReplyLength,
    /// Unexpected version byte in a reply.
    BadVersion,
    /// The proxy offered no authentication method we support.
    NoAcceptableMethod,
    /// The proxy rejected the username/password pair.
    AuthRejected,
    /// Non-zero status in the connect reply, carrying the status byte.
    ConnectRefused(u8),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadReplyLength       => write!(f, "reply length invalid for state"),
            Self::BadVersion           => write!(f, "unexpected version byte"),
            Self::NoAcceptableMethod   => write!(f, "no acceptable authentication method"),
            Self::AuthRejected         => write!(f, "credentials rejected"),
            Self::ConnectRefused(code) => write!(f, "connect refused (status {code:#04x})"),
        }
    }
}

impl std::error::Error for ProxyError {}

// ─── FrameError ───────────────────────────────────────────────────────────────

/// Malformed inbound framing. Always fatal for the connection — a desynced
/// keystream cannot be partially recovered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Length prefix exceeds the hard frame cap.
    Oversized(usize),
    /// Length prefix cannot describe a real frame.
    BadLength(u32),
    /// TLS-variant record did not start with an application-data header.
    BadRecordHeader,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversized(len)   => write!(f, "frame length {len} exceeds cap"),
            Self::BadLength(raw)   => write!(f, "impossible frame length {raw:#x}"),
            Self::BadRecordHeader  => write!(f, "bad TLS record header"),
        }
    }
}

impl std::error::Error for FrameError {}

