//! Packet codec: bounds-checked big-endian field access and the command
//! frame layouts for datagram and stream transports.

pub mod cursor;
pub mod frame;

pub use cursor::{Reader, Writer};
pub use frame::{Frame, FrameHeader, StreamAssembler};
