//! An instant-messaging protocol engine.
//!
//! The crate implements the client side of a proprietary IM protocol:
//!
//! - a 64-bit-block round cipher in a two-stage chaining mode with
//!   randomized header padding and a verified zero trailer ([`crypto`]);
//! - big-endian packet framing for datagram and length-prefixed stream
//!   transports ([`codec`]);
//! - a reliable command channel with sequence numbers, a pending-ack
//!   resend queue and full-range duplicate suppression ([`channel`]);
//! - a peer-to-peer UDP file-transfer sub-protocol with a fixed-width
//!   selective-ack sliding window ([`transfer`]);
//! - a single-task connection driver tying it all together ([`engine`]).
//!
//! All protocol state machines are pure: they consume packets and clock
//! ticks and return declarative outputs (frames to transmit, events to
//! surface). Socket I/O lives only in [`engine`] and
//! [`transfer::driver`], so every protocol rule is unit-testable without
//! a network.

pub mod channel;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod transfer;

pub use engine::{run_engine, EngineConfig, EngineHandle};
pub use error::{ChannelError, CipherError, CodecError, TransferError};
pub use events::{EngineCommand, EngineEvent, TransferId, TransferStatus};
