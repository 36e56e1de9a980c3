//! 16-byte digests used by the protocol.
//!
//! The login key is a double digest of the account password; file
//! transfers carry whole-file and filename digests in their metadata
//! packet so the receiver can verify what landed on disk.

use md5::{Digest, Md5};
use std::io::Read;
use std::path::Path;

/// Digest an in-memory buffer.
pub fn digest16(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Derive the login key from an account password: two digest passes, so
/// the cleartext password never leaves this function.
pub fn password_key(password: &str) -> [u8; 16] {
    digest16(&digest16(password.as_bytes()))
}

/// Streaming digest of a file on disk.
pub fn file_digest(path: &Path) -> std::io::Result<[u8; 16]> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("lumiq_test").join("digest").join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    #[test]
    fn known_vector() {
        // RFC 1321 test suite: MD5("abc")
        assert_eq!(
            digest16(b"abc"),
            [
                0x90, 0x01, 0x50, 0x98, 0x3c, 0xd2, 0x4f, 0xb0, 0xd6, 0x96, 0x3f, 0x7d, 0x28,
                0xe1, 0x7f, 0x72
            ]
        );
    }

    #[test]
    fn password_key_is_double_digest() {
        let pw = "hunter2";
        assert_eq!(password_key(pw), digest16(&digest16(pw.as_bytes())));
        assert_ne!(password_key(pw), digest16(pw.as_bytes()));
    }

    #[test]
    fn file_digest_matches_buffer_digest() {
        let dir = test_dir("file");
        let path = dir.join("blob.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(file_digest(&path).unwrap(), digest16(&data));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
