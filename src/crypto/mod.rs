//! Cryptographic primitives: the wire cipher and the 16-byte digests.

pub mod digest;
pub mod tea;

use rand::RngCore;

/// 128-bit key used everywhere a key appears in the protocol: the derived
/// password key, the login session key and per-transfer keys.
pub type SessionKey = [u8; 16];

/// Draw a fresh random session key.
pub fn random_session_key() -> SessionKey {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
