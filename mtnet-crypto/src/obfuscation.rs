//! Obfuscated-transport init payload and per-direction key derivation.
//!
//! The first 64 bytes a connection sends double as (a) the framing-variant
//! announcement to the server and (b) the seed for both keystreams. Bytes
//! 0..56 stay random-looking on the wire; only the tail carrying the variant
//! tag and datacenter marker goes out encrypted, so the whole preamble is
//! indistinguishable from noise to a passive observer.

use sha2::{Digest, Sha256};

use crate::Keystream;

/// Variant tag for the abridged framing, bytes 56..60 of the init payload.
pub const TAG_ABRIDGED: [u8; 4] = [0xef, 0xef, 0xef, 0xef];
/// Variant tag for the intermediate framing.
pub const TAG_INTERMEDIATE: [u8; 4] = [0xee, 0xee, 0xee, 0xee];
/// Variant tag for the padded-intermediate framing.
pub const TAG_PADDED_INTERMEDIATE: [u8; 4] = [0xdd, 0xdd, 0xdd, 0xdd];

/// Little-endian first words that must never start the payload: plaintext
/// protocol starts (HTTP verbs, TLS handshake) and the variant tags.
fn first_word_forbidden(word: u32) -> bool {
    matches!(
        word,
        0x4441_4548 // "HEAD"
            | 0x5453_4f50 // "POST"
            | 0x2054_4547 // "GET "
            | 0x4954_504f // "OPTI"
            | 0x0201_0316 // TLS handshake record start
            | 0xdddd_dddd
            | 0xeeee_eeee
    )
}

/// One direction's derived CTR parameters.
pub struct DirectionKeys {
    /// AES-256 key.
    pub key: [u8; 32],
    /// CTR initialization vector.
    pub iv: [u8; 16],
}

/// A freshly generated obfuscation preamble plus the keystreams it seeds.
pub struct ObfuscatedInit {
    /// The 64 bytes to write to the socket before anything else.
    pub payload: [u8; 64],
    /// Keystream for outbound bytes (already advanced past the preamble).
    pub send: Keystream,
    /// Keystream for inbound bytes (counter at zero).
    pub recv: Keystream,
}

impl ObfuscatedInit {
    /// Generate a preamble announcing `tag`, carrying `dc_marker`, optionally
    /// strengthened with an MTProxy-style 16-byte secret.
    pub fn generate(tag: [u8; 4], dc_marker: i16, secret: Option<&[u8; 16]>) -> Self {
        let mut init = [0u8; 64];
        loop {
            getrandom::getrandom(&mut init).expect("getrandom");
            if init[0] == 0xef {
                continue;
            }
            let first = u32::from_le_bytes([init[0], init[1], init[2], init[3]]);
            let second = u32::from_le_bytes([init[4], init[5], init[6], init[7]]);
            if first_word_forbidden(first) || second == 0 {
                continue;
            }
            break;
        }
        init[56..60].copy_from_slice(&tag);
        init[60..62].copy_from_slice(&dc_marker.to_le_bytes());

        let keys = derive_keys(&init, secret);
        let mut send = Keystream::new(&keys.0.key, &keys.0.iv);
        let recv = Keystream::new(&keys.1.key, &keys.1.iv);

        // Encrypt a copy of the whole payload, then splice the ciphertext of
        // the tail back in. The send counter ends up at 64 bytes, matching
        // what the server's decryptor will have consumed.
        let mut encrypted = init;
        send.apply(&mut encrypted);
        init[56..64].copy_from_slice(&encrypted[56..64]);

        Self { payload: init, send, recv }
    }
}

/// Derive `(send, recv)` CTR parameters from an init payload.
///
/// Send keys come from bytes 8..56 as-is; receive keys from the same bytes
/// reversed. With a proxy `secret`, each key is additionally hashed with it.
pub fn derive_keys(init: &[u8; 64], secret: Option<&[u8; 16]>) -> (DirectionKeys, DirectionKeys) {
    let forward = direction_keys(&init[8..56], secret);

    let mut reversed = [0u8; 48];
    for (i, byte) in init[8..56].iter().rev().enumerate() {
        reversed[i] = *byte;
    }
    let backward = direction_keys(&reversed, secret);

    (forward, backward)
}

fn direction_keys(material: &[u8], secret: Option<&[u8; 16]>) -> DirectionKeys {
    debug_assert_eq!(material.len(), 48);
    let mut key = [0u8; 32];
    key.copy_from_slice(&material[..32]);
    if let Some(secret) = secret {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(secret);
        key.copy_from_slice(&hasher.finalize());
    }
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&material[32..48]);
    DirectionKeys { key, iv }
}
