//! The wire cipher: a 16-round 64-bit block cipher in a two-stage
//! chaining mode with randomized padding.
//!
//! Every encrypted body on the wire goes through this module. The block
//! primitive is keyed with four big-endian u32 words; the chaining mode
//! XORs each plaintext block with the previous ciphertext block before
//! the rounds and XORs the round output with the previous plaintext
//! block after, so a single flipped ciphertext bit garbles the rest of
//! the packet and trips the trailer check.
//!
//! Plaintext image inside the cipher:
//!
//! ```text
//! [desc][pad random bytes][2 random bytes][payload][7 zero bytes]
//! ```
//!
//! `pad = (8 - ((n + 10) % 8)) % 8` and `desc = (random & 0xF8) | pad`,
//! which makes the total a multiple of 8 and at least 16 bytes. Decrypt
//! recovers the payload by skipping `(desc & 7) + 3` bytes and verifies
//! that the final 7 bytes are zero.

use crate::crypto::SessionKey;
use crate::error::CipherError;
use rand::RngCore;

/// Cipher block size in bytes.
pub const BLOCK_LEN: usize = 8;

/// Random filler ahead of the payload: 1 descriptor + 2 fixed random
/// bytes; the 7-byte zero trailer follows the payload.
const OVERHEAD: usize = 10;

const DELTA: u32 = 0x9E37_79B9;
const ROUNDS: u32 = 16;

fn key_words(key: &SessionKey) -> [u32; 4] {
    [
        u32::from_be_bytes([key[0], key[1], key[2], key[3]]),
        u32::from_be_bytes([key[4], key[5], key[6], key[7]]),
        u32::from_be_bytes([key[8], key[9], key[10], key[11]]),
        u32::from_be_bytes([key[12], key[13], key[14], key[15]]),
    ]
}

fn encipher_block(block: [u8; BLOCK_LEN], key: &SessionKey) -> [u8; BLOCK_LEN] {
    let [a, b, c, d] = key_words(key);
    let mut y = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
    let mut z = u32::from_be_bytes([block[4], block[5], block[6], block[7]]);
    let mut sum = 0u32;
    for _ in 0..ROUNDS {
        sum = sum.wrapping_add(DELTA);
        y = y.wrapping_add(
            ((z << 4).wrapping_add(a)) ^ z.wrapping_add(sum) ^ ((z >> 5).wrapping_add(b)),
        );
        z = z.wrapping_add(
            ((y << 4).wrapping_add(c)) ^ y.wrapping_add(sum) ^ ((y >> 5).wrapping_add(d)),
        );
    }
    let mut out = [0u8; BLOCK_LEN];
    out[..4].copy_from_slice(&y.to_be_bytes());
    out[4..].copy_from_slice(&z.to_be_bytes());
    out
}

fn decipher_block(block: [u8; BLOCK_LEN], key: &SessionKey) -> [u8; BLOCK_LEN] {
    let [a, b, c, d] = key_words(key);
    let mut y = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
    let mut z = u32::from_be_bytes([block[4], block[5], block[6], block[7]]);
    let mut sum = DELTA.wrapping_mul(ROUNDS);
    for _ in 0..ROUNDS {
        z = z.wrapping_sub(
            ((y << 4).wrapping_add(c)) ^ y.wrapping_add(sum) ^ ((y >> 5).wrapping_add(d)),
        );
        y = y.wrapping_sub(
            ((z << 4).wrapping_add(a)) ^ z.wrapping_add(sum) ^ ((z >> 5).wrapping_add(b)),
        );
        sum = sum.wrapping_sub(DELTA);
    }
    let mut out = [0u8; BLOCK_LEN];
    out[..4].copy_from_slice(&y.to_be_bytes());
    out[4..].copy_from_slice(&z.to_be_bytes());
    out
}

fn xor_block(a: [u8; BLOCK_LEN], b: [u8; BLOCK_LEN]) -> [u8; BLOCK_LEN] {
    let mut out = [0u8; BLOCK_LEN];
    for i in 0..BLOCK_LEN {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn block_at(buf: &[u8], index: usize) -> [u8; BLOCK_LEN] {
    let mut out = [0u8; BLOCK_LEN];
    out.copy_from_slice(&buf[index * BLOCK_LEN..(index + 1) * BLOCK_LEN]);
    out
}

/// Encrypt `plain` under `key`. Infallible: any payload length (zero
/// included) produces a ciphertext that is a multiple of 8 bytes and at
/// least 16 bytes long.
pub fn encrypt(plain: &[u8], key: &SessionKey) -> Vec<u8> {
    let pad = (BLOCK_LEN - ((plain.len() + OVERHEAD) % BLOCK_LEN)) % BLOCK_LEN;
    let total = plain.len() + pad + OVERHEAD;

    let mut image = vec![0u8; total];
    let mut rng = rand::thread_rng();
    let mut filler = vec![0u8; pad + 3];
    rng.fill_bytes(&mut filler);
    filler[0] = (filler[0] & 0xF8) | pad as u8;
    image[..pad + 3].copy_from_slice(&filler);
    image[pad + 3..pad + 3 + plain.len()].copy_from_slice(plain);
    // trailing 7 bytes stay zero

    let mut out = vec![0u8; total];
    let mut prev_plain = [0u8; BLOCK_LEN];
    let mut prev_cipher = [0u8; BLOCK_LEN];
    for i in 0..total / BLOCK_LEN {
        let p = block_at(&image, i);
        let rounds_in = xor_block(p, prev_cipher);
        let c = xor_block(encipher_block(rounds_in, key), prev_plain);
        out[i * BLOCK_LEN..(i + 1) * BLOCK_LEN].copy_from_slice(&c);
        prev_plain = p;
        prev_cipher = c;
    }
    out
}

/// Decrypt `cipher` under `key`, returning the embedded payload.
///
/// Rejects inputs that are misaligned, shorter than two blocks, carry a
/// padding descriptor pointing past the end, or fail the 7-byte zero
/// trailer check.
pub fn decrypt(cipher: &[u8], key: &SessionKey) -> Result<Vec<u8>, CipherError> {
    let len = cipher.len();
    if len % BLOCK_LEN != 0 {
        return Err(CipherError::Misaligned(len));
    }
    if len < 2 * BLOCK_LEN {
        return Err(CipherError::TooShort(len));
    }

    let mut image = vec![0u8; len];
    let mut prev_plain = [0u8; BLOCK_LEN];
    let mut prev_cipher = [0u8; BLOCK_LEN];
    for i in 0..len / BLOCK_LEN {
        let c = block_at(cipher, i);
        let rounds_out = xor_block(c, prev_plain);
        let p = xor_block(decipher_block(rounds_out, key), prev_cipher);
        image[i * BLOCK_LEN..(i + 1) * BLOCK_LEN].copy_from_slice(&p);
        prev_plain = p;
        prev_cipher = c;
    }

    let skip = (image[0] & 7) as usize + 3;
    if skip + 7 > len {
        return Err(CipherError::BadPadding);
    }
    if image[len - 7..].iter().any(|&b| b != 0) {
        return Err(CipherError::TrailerMismatch);
    }
    Ok(image[skip..len - 7].to_vec())
}
