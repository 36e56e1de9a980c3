//! The engine's outward face: events it emits and commands it accepts.

use crate::channel::Command;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Engine-local identifier for one transfer, stable from the moment it
/// is announced until its removal event.
pub type TransferId = u32;

/// User-visible transfer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Announced, waiting for the peer (or the local user) to accept.
    Waiting,
    Transferring,
    Finished,
    Canceled,
    Failed,
}

/// Everything the engine reports upward.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    LoggedIn {
        public_ip: Ipv4Addr,
        public_port: u16,
    },
    ConnectionLost {
        reason: String,
    },
    MessageReceived {
        from: u32,
        text: String,
    },
    SystemNotice {
        text: String,
    },
    BuddyStatusChanged {
        id: u32,
        status: u8,
    },
    /// A command exhausted its resend budget without a fatal outcome.
    CommandFailed {
        command: Command,
        seq: u16,
    },
    TransferAdded {
        id: TransferId,
        peer: u32,
        filename: String,
        size: u64,
        inbound: bool,
    },
    TransferProgress {
        id: TransferId,
        bytes: u64,
        total: u64,
    },
    TransferStatusChanged {
        id: TransferId,
        status: TransferStatus,
    },
    /// Terminal: the id will not be referenced again.
    TransferRemoved {
        id: TransferId,
    },
}

/// Everything the caller may ask of a running engine.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    SendMessage { to: u32, text: String },
    OfferFile { to: u32, path: PathBuf },
    AcceptTransfer { id: TransferId, dest: PathBuf },
    RejectTransfer { id: TransferId },
    CancelTransfer { id: TransferId },
    Shutdown,
}
