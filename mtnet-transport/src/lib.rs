//! MTProto client transport core.
//!
//! This crate owns raw sockets and multiplexes them through a
//! single-threaded readiness reactor:
//!
//! * [`reactor`] / [`timer`] — the mio-backed event loop and its
//!   deadline-ordered timer queue.
//! * [`socket`] / [`socks5`] — non-blocking TCP with an outbound buffer,
//!   idle-timeout tracking and an in-house SOCKS5 handshake state machine.
//! * [`session`] — per-connection sequencing, bounded-memory message-id
//!   deduplication and pending-ack bookkeeping.
//! * [`framing`] — the obfuscated framing variants and the per-direction
//!   CTR keystreams (see [`mtnet_crypto`]).
//! * [`connection`] — the composition root with its reconnect/backoff
//!   lifecycle.
//! * [`manager`] — the orchestrator boundary: connection pool, cross-thread
//!   task queue, delegate callbacks.
//!
//! Key negotiation, TL (de)serialization and request routing live above
//! this crate; it moves opaque frames.

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod framing;
pub mod manager;
pub mod reactor;
pub mod resolver;
pub mod session;
pub mod socket;
pub mod socks5;
pub mod timer;
pub mod wire;

pub use connection::{Connection, ConnectionEvent, ConnectionKind, ConnectionOptions, ConnectionState};
pub use errors::{DisconnectReason, FrameError, ProxyError};
pub use framing::{FrameCodec, Inbound, ProtocolVariant};
pub use manager::{
    ConnectionKey, Endpoint, TransportContext, TransportDelegate, TransportHandle, TransportLoop,
};
pub use reactor::{Reactor, ReadinessSource, Sweep, Wakeup};
pub use resolver::{Resolver, ThreadResolver};
pub use session::{ProcessedState, SessionState};
pub use socket::{SocketEvent, SocketTransport};
pub use socks5::{HandshakeState, HandshakeStep, ProxyHandshake, Socks5Config};
pub use timer::{TimerId, TimerQueue};
