//! Wire-level cryptography for the MTProto client transport core.
//!
//! This crate is the only place key material is touched:
//! * [`Keystream`] — one direction of an AES-256-CTR stream cipher, applied
//!   byte-by-byte to everything that crosses the socket after the preamble.
//! * [`obfuscation`] — construction of the 64-byte obfuscated-transport init
//!   payload and derivation of the two per-direction key/IV pairs from it.
//!
//! Authorization-key negotiation (DH) and MTProto payload encryption live
//! above this layer and are out of scope here.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod keystream;
pub mod obfuscation;

pub use keystream::Keystream;
pub use obfuscation::{DirectionKeys, ObfuscatedInit};
