//! Per-direction CTR keystream state.

use aes::Aes256;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};

type Aes256Ctr = Ctr128BE<Aes256>;

/// One direction of the obfuscated-transport stream cipher.
///
/// Wraps an AES-256-CTR state whose block counter and intra-block offset
/// advance with every byte pushed through [`Keystream::apply`]. Both peers
/// must transform exactly the same byte positions or the streams desync —
/// there is no resynchronization, the connection is torn down instead.
///
/// A connection owns exactly two of these (send and receive), created
/// together from one init payload and discarded with the connection.
pub struct Keystream {
    cipher: Aes256Ctr,
}

impl Keystream {
    /// Build a keystream from a derived key/IV pair.
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self { cipher: Aes256Ctr::new(key.into(), iv.into()) }
    }

    /// XOR the running keystream over `bytes` in place, advancing the
    /// internal counter. Encryption and decryption are the same operation.
    pub fn apply(&mut self, bytes: &mut [u8]) {
        self.cipher.apply_keystream(bytes);
    }

    /// Advance the counter over `len` bytes without producing output.
    ///
    /// Used to mirror the 64 preamble bytes a peer has already consumed.
    pub fn skip(&mut self, len: usize) {
        let mut scratch = [0u8; 64];
        let mut remaining = len;
        while remaining > 0 {
            let step = remaining.min(scratch.len());
            self.cipher.apply_keystream(&mut scratch[..step]);
            remaining -= step;
        }
    }
}
