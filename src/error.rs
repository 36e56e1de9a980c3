//! Typed error taxonomy.
//!
//! Decode and cipher errors are recoverable by construction: the caller
//! logs them and drops the offending packet. Channel and transfer errors
//! carry enough context for the engine to decide between retry, surface
//! and teardown.

use thiserror::Error;

/// Structural packet decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated packet: needed {needed} more bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("bad frame header tag 0x{0:02x}")]
    BadHeaderTag(u8),

    #[error("bad frame trailer tag 0x{0:02x}")]
    BadTrailerTag(u8),

    #[error("frame length {0} out of range")]
    BadLength(usize),

    #[error("unknown packet discriminant 0x{0:04x}")]
    UnknownKind(u16),
}

/// Cipher-layer rejections. Any of these means the packet was corrupted
/// in flight or encrypted under a different key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("ciphertext length {0} is not a multiple of the block size")]
    Misaligned(usize),

    #[error("ciphertext length {0} is below the two-block minimum")]
    TooShort(usize),

    #[error("padding descriptor points past the packet end")]
    BadPadding,

    #[error("zero trailer verification failed")]
    TrailerMismatch,
}

/// Command-channel failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("server rejected login (status 0x{0:02x})")]
    LoginRejected(u8),

    #[error("malformed login reply")]
    MalformedLoginReply,

    #[error("command 0x{command:04x} seq {seq} undelivered after {resends} resends")]
    DeliveryFailed { command: u16, seq: u16, resends: u32 },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// File-transfer session failures.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("peer unreachable: handshake timed out on every path")]
    HandshakeTimeout,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("received file failed digest verification")]
    DigestMismatch,

    #[error("fragment store: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Cipher(#[from] CipherError),
}
