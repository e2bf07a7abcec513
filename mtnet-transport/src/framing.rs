//! Framing variants and the per-connection frame codec.
//!
//! A [`FrameCodec`] owns the two keystreams and converts between opaque
//! application payloads and the encrypted byte stream. The variant is chosen
//! once at connect time (it is announced in the obfuscation preamble) and
//! fixed for the connection's lifetime.
//!
//! Outbound bytes only ever leave this module framed and encrypted; inbound
//! bytes are decrypted, reassembled across reads, and surfaced as complete
//! frames or quick-ack tokens. A malformed length is a [`FrameError`] and
//! tears the connection down — a desynced stream has no partial recovery.

use mtnet_crypto::obfuscation::{
    TAG_ABRIDGED, TAG_INTERMEDIATE, TAG_PADDED_INTERMEDIATE,
};
use mtnet_crypto::Keystream;

use crate::errors::FrameError;

/// Hard cap on a single frame; anything larger means keystream desync.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Quick-ack request/response flag: bit 31 of an intermediate length word,
/// bit 7 of the first abridged length byte.
const QUICK_ACK_FLAG: u32 = 0x8000_0000;

/// TLS application-data record limit for the disguised variant.
const TLS_RECORD_LIMIT: usize = 16 * 1024;
const TLS_RECORD_HEADER: [u8; 3] = [0x17, 0x03, 0x03];

// ─── ProtocolVariant ──────────────────────────────────────────────────────────

/// Wire framing selected once at connect time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVariant {
    /// 4-byte little-endian length prefix.
    Intermediate,
    /// Like intermediate, with 0–15 random padding bytes counted by the
    /// prefix. Resists length fingerprinting.
    PaddedIntermediate,
    /// Word-count prefix: one byte below 0x7f, else `0x7f` + 3 bytes.
    Abridged,
    /// Padded-intermediate frames wrapped in TLS application-data records.
    Tls,
}

impl ProtocolVariant {
    /// The tag announced in the obfuscation preamble.
    pub fn tag(self) -> [u8; 4] {
        match self {
            Self::Intermediate => TAG_INTERMEDIATE,
            Self::PaddedIntermediate | Self::Tls => TAG_PADDED_INTERMEDIATE,
            Self::Abridged => TAG_ABRIDGED,
        }
    }

    fn padded(self) -> bool {
        matches!(self, Self::PaddedIntermediate | Self::Tls)
    }
}

// ─── Inbound units ────────────────────────────────────────────────────────────

/// One decoded inbound unit.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A complete application frame.
    Frame(Vec<u8>),
    /// A quick-ack token (flag bit already stripped).
    QuickAck(u32),
}

// ─── FrameCodec ───────────────────────────────────────────────────────────────

/// Encrypting framer/deframer for one connection.
pub struct FrameCodec {
    variant: ProtocolVariant,
    send: Keystream,
    recv: Keystream,
    /// Decrypted inbound bytes not yet assembled into a frame.
    inbound: Vec<u8>,
    /// Raw (still TLS-framed) inbound bytes, TLS variant only.
    records: Vec<u8>,
}

impl FrameCodec {
    pub fn new(variant: ProtocolVariant, send: Keystream, recv: Keystream) -> Self {
        Self {
            variant,
            send,
            recv,
            inbound: Vec::new(),
            records: Vec::new(),
        }
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    /// Frame and encrypt one outbound payload.
    ///
    /// `quick_ack` asks the server for a lightweight receipt before full
    /// processing.
    pub fn encode(&mut self, payload: &[u8], quick_ack: bool) -> Vec<u8> {
        let mut frame = match self.variant {
            ProtocolVariant::Abridged => encode_abridged(payload, quick_ack),
            _ => encode_intermediate(payload, quick_ack, self.variant.padded()),
        };
        self.send.apply(&mut frame);
        if self.variant == ProtocolVariant::Tls {
            wrap_tls_records(&frame)
        } else {
            frame
        }
    }

    /// Decrypt an inbound chunk and return every unit completed by it.
    ///
    /// Partial frames are buffered across calls; a malformed length is
    /// fatal.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Inbound>, FrameError> {
        if self.variant == ProtocolVariant::Tls {
            self.records.extend_from_slice(chunk);
            while let Some(body_len) = self.next_record_len()? {
                let mut body: Vec<u8> = self.records.drain(..5 + body_len).skip(5).collect();
                self.recv.apply(&mut body);
                self.inbound.extend_from_slice(&body);
            }
        } else {
            let mut decrypted = chunk.to_vec();
            self.recv.apply(&mut decrypted);
            self.inbound.extend_from_slice(&decrypted);
        }

        let mut out = Vec::new();
        match self.variant {
            ProtocolVariant::Abridged => self.drain_abridged(&mut out)?,
            _ => self.drain_intermediate(&mut out)?,
        }
        Ok(out)
    }

    /// Length of the next complete TLS record body, if fully buffered.
    fn next_record_len(&self) -> Result<Option<usize>, FrameError> {
        if self.records.len() < 5 {
            return Ok(None);
        }
        if self.records[..3] != TLS_RECORD_HEADER {
            return Err(FrameError::BadRecordHeader);
        }
        let body_len = u16::from_be_bytes([self.records[3], self.records[4]]) as usize;
        if body_len == 0 || body_len > TLS_RECORD_LIMIT {
            return Err(FrameError::BadRecordHeader);
        }
        if self.records.len() < 5 + body_len {
            return Ok(None);
        }
        Ok(Some(body_len))
    }

    fn drain_intermediate(&mut self, out: &mut Vec<Inbound>) -> Result<(), FrameError> {
        loop {
            if self.inbound.len() < 4 {
                return Ok(());
            }
            let word = u32::from_le_bytes(self.inbound[..4].try_into().unwrap());
            if word & QUICK_ACK_FLAG != 0 {
                self.inbound.drain(..4);
                out.push(Inbound::QuickAck(word & !QUICK_ACK_FLAG));
                continue;
            }
            let len = word as usize;
            if len == 0 {
                return Err(FrameError::BadLength(word));
            }
            if len > MAX_FRAME_LEN {
                return Err(FrameError::Oversized(len));
            }
            if self.inbound.len() < 4 + len {
                return Ok(());
            }
            let frame: Vec<u8> = self.inbound.drain(..4 + len).skip(4).collect();
            out.push(Inbound::Frame(frame));
        }
    }

    fn drain_abridged(&mut self, out: &mut Vec<Inbound>) -> Result<(), FrameError> {
        loop {
            if self.inbound.is_empty() {
                return Ok(());
            }
            let first = self.inbound[0];
            if first & 0x80 != 0 {
                // Quick-ack token: four bytes, flag bit in the first.
                if self.inbound.len() < 4 {
                    return Ok(());
                }
                let token = u32::from_le_bytes([
                    self.inbound[0] & 0x7f,
                    self.inbound[1],
                    self.inbound[2],
                    self.inbound[3],
                ]);
                self.inbound.drain(..4);
                out.push(Inbound::QuickAck(token));
                continue;
            }
            let (header_len, words) = if first < 0x7f {
                (1usize, first as usize)
            } else {
                if self.inbound.len() < 4 {
                    return Ok(());
                }
                let words = self.inbound[1] as usize
                    | (self.inbound[2] as usize) << 8
                    | (self.inbound[3] as usize) << 16;
                (4usize, words)
            };
            let len = words * 4;
            if len == 0 {
                return Err(FrameError::BadLength(first as u32));
            }
            if len > MAX_FRAME_LEN {
                return Err(FrameError::Oversized(len));
            }
            if self.inbound.len() < header_len + len {
                return Ok(());
            }
            let frame: Vec<u8> = self.inbound.drain(..header_len + len).skip(header_len).collect();
            out.push(Inbound::Frame(frame));
        }
    }
}

// ─── Encoders ─────────────────────────────────────────────────────────────────

fn encode_intermediate(payload: &[u8], quick_ack: bool, padded: bool) -> Vec<u8> {
    let padding = if padded { random_padding() } else { Vec::new() };
    let mut word = (payload.len() + padding.len()) as u32;
    if quick_ack {
        word |= QUICK_ACK_FLAG;
    }
    let mut out = Vec::with_capacity(4 + payload.len() + padding.len());
    out.extend_from_slice(&word.to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&padding);
    out
}

fn encode_abridged(payload: &[u8], quick_ack: bool) -> Vec<u8> {
    debug_assert_eq!(payload.len() % 4, 0, "abridged frames are word-aligned");
    let words = payload.len() / 4;
    let mut out = Vec::with_capacity(4 + payload.len());
    if words < 0x7f {
        out.push(words as u8);
    } else {
        out.push(0x7f);
        out.push((words & 0xff) as u8);
        out.push(((words >> 8) & 0xff) as u8);
        out.push(((words >> 16) & 0xff) as u8);
    }
    if quick_ack {
        out[0] |= 0x80;
    }
    out.extend_from_slice(payload);
    out
}

fn wrap_tls_records(encrypted: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encrypted.len() + 5 * (encrypted.len() / TLS_RECORD_LIMIT + 1));
    for body in encrypted.chunks(TLS_RECORD_LIMIT) {
        out.extend_from_slice(&TLS_RECORD_HEADER);
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
    }
    out
}

fn random_padding() -> Vec<u8> {
    let mut len = [0u8; 1];
    getrandom::getrandom(&mut len).expect("getrandom");
    let mut padding = vec![0u8; (len[0] & 0x0f) as usize];
    if !padding.is_empty() {
        getrandom::getrandom(&mut padding).expect("getrandom");
    }
    padding
}
