//! Minimal wire helpers for the few service payloads the transport emits
//! blind. There is deliberately no schema layer here — application payloads
//! are opaque bytes to this crate.

/// `msgs_ack` constructor id.
pub const MSGS_ACK: u32 = 0x62d6_b459;
/// Bare `vector` constructor id.
pub const VECTOR: u32 = 0x1cb5_c415;

/// Serialize one `msgs_ack` batch over `ids`.
pub fn msgs_ack(ids: &[i64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + ids.len() * 8);
    out.extend_from_slice(&MSGS_ACK.to_le_bytes());
    out.extend_from_slice(&VECTOR.to_le_bytes());
    out.extend_from_slice(&(ids.len() as i32).to_le_bytes());
    for id in ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}
