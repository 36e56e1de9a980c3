//! Command frame layout and stream reassembly.
//!
//! A command frame is
//!
//! ```text
//! [0x02][source u16][command u16][sequence u16][body…][0x03]
//! ```
//!
//! On a datagram transport the frame is the whole packet. On a stream
//! transport each frame is preceded by a u16 length that counts itself;
//! the declared length is authoritative, byte counts returned by the
//! transport are not. [`StreamAssembler`] buffers partial reads and
//! resynchronizes after corruption by scanning for the next trailer
//! byte, so one bad frame never poisons the connection.

use crate::codec::cursor::{Reader, Writer};
use crate::config::{FRAME_HEADER_TAG, FRAME_TRAILER_TAG, MAX_PACKET_SIZE, SOURCE_TAG};
use crate::error::CodecError;
use tracing::warn;

/// Tag + source + command + sequence.
const HEADER_LEN: usize = 7;

/// Smallest well-formed datagram frame (empty body).
const MIN_FRAME_LEN: usize = HEADER_LEN + 1;

/// Smallest well-formed stream record: length prefix + empty frame.
const MIN_STREAM_LEN: usize = 2 + MIN_FRAME_LEN;

// ── Frame ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub source: u16,
    pub command: u16,
    pub seq: u16,
}

/// A decoded frame borrowing its (still encrypted) body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    pub body: &'a [u8],
}

/// Encode a datagram frame.
pub fn encode_datagram(command: u16, seq: u16, body: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(MIN_FRAME_LEN + body.len());
    w.put_u8(FRAME_HEADER_TAG);
    w.put_u16(SOURCE_TAG);
    w.put_u16(command);
    w.put_u16(seq);
    w.put_bytes(body);
    w.put_u8(FRAME_TRAILER_TAG);
    w.into_inner()
}

/// Encode a stream record: length prefix plus the datagram frame image.
pub fn encode_stream(command: u16, seq: u16, body: &[u8]) -> Vec<u8> {
    let total = 2 + MIN_FRAME_LEN + body.len();
    debug_assert!(total <= MAX_PACKET_SIZE);
    let mut w = Writer::with_capacity(total);
    w.put_u16(total as u16);
    w.put_u8(FRAME_HEADER_TAG);
    w.put_u16(SOURCE_TAG);
    w.put_u16(command);
    w.put_u16(seq);
    w.put_bytes(body);
    w.put_u8(FRAME_TRAILER_TAG);
    w.into_inner()
}

/// Decode a datagram-shaped frame (no length prefix). Validates the
/// header and trailer tags; the source tag is informational and carried
/// through undecoded.
pub fn decode_datagram(buf: &[u8]) -> Result<Frame<'_>, CodecError> {
    if buf.len() < MIN_FRAME_LEN {
        return Err(CodecError::BadLength(buf.len()));
    }
    if buf[0] != FRAME_HEADER_TAG {
        return Err(CodecError::BadHeaderTag(buf[0]));
    }
    if buf[buf.len() - 1] != FRAME_TRAILER_TAG {
        return Err(CodecError::BadTrailerTag(buf[buf.len() - 1]));
    }
    let mut r = Reader::new(&buf[1..buf.len() - 1]);
    let header = FrameHeader {
        source: r.get_u16()?,
        command: r.get_u16()?,
        seq: r.get_u16()?,
    };
    Ok(Frame {
        header,
        body: r.rest(),
    })
}

// ── Stream reassembly ──────────────────────────────────────────────────────────

/// Incremental reassembler for the length-prefixed stream encoding.
///
/// Feed raw reads with [`push`](Self::push), then drain complete frames
/// with [`next_frame`](Self::next_frame). Yields datagram-shaped frame
/// images (prefix stripped) so the rest of the stack is transport
/// agnostic.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    pending: Vec<u8>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Pop the next complete frame, resynchronizing past garbage.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.pending.len() < 2 {
                return None;
            }
            let declared = u16::from_be_bytes([self.pending[0], self.pending[1]]) as usize;
            if declared < MIN_STREAM_LEN || declared > MAX_PACKET_SIZE {
                warn!(declared, "stream record length out of range, resyncing");
                self.resync();
                continue;
            }
            // check the header tag before the full record arrives, so a
            // corrupt length prefix cannot stall the stream
            if self.pending.len() >= 3 && self.pending[2] != FRAME_HEADER_TAG {
                warn!(declared, "stream record failed header check, resyncing");
                self.resync();
                continue;
            }
            if self.pending.len() < declared {
                return None;
            }
            if self.pending[declared - 1] != FRAME_TRAILER_TAG {
                warn!(declared, "stream record failed trailer check, resyncing");
                self.resync();
                continue;
            }
            let frame = self.pending[2..declared].to_vec();
            self.pending.drain(..declared);
            return Some(frame);
        }
    }

    /// Skip to just past the next trailer byte, or empty the buffer if
    /// no trailer is in sight.
    fn resync(&mut self) {
        match self.pending[1..].iter().position(|&b| b == FRAME_TRAILER_TAG) {
            Some(offset) => {
                self.pending.drain(..offset + 2);
            }
            None => self.pending.clear(),
        }
    }
}
