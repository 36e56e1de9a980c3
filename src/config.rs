//! Protocol constants and tunables.
//!
//! Everything time- or size-related lives here so the state machines stay
//! free of magic numbers.

use std::time::Duration;

// ── Framing ────────────────────────────────────────────────────────────────────

/// Largest packet the codec will produce or accept.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Client source/version tag placed in every command frame header.
pub const SOURCE_TAG: u16 = 0x0D55;

/// First byte of every command frame.
pub const FRAME_HEADER_TAG: u8 = 0x02;

/// Last byte of every command frame.
pub const FRAME_TRAILER_TAG: u8 = 0x03;

// ── Command channel ────────────────────────────────────────────────────────────

/// How often the pending-ack queue is scanned for overdue commands.
pub const RESEND_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Age after which an unacknowledged command is retransmitted.
pub const COMMAND_RESEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Retransmissions before a command is declared undeliverable.
pub const MAX_COMMAND_RESENDS: u32 = 3;

/// Interval between keep-alive commands on an established connection.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

// ── File transfer ──────────────────────────────────────────────────────────────

/// Payload bytes carried by one file fragment.
pub const FRAGMENT_LEN: u32 = 1000;

/// Width of the selective-ack sliding window, in fragments.
pub const TRANSFER_WINDOW_WIDTH: u32 = 32;

/// How long to wait for a pong (or hello ack) before switching paths.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall budget for the connect-and-hello handshake on one path.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between retransmissions of unacknowledged fragments.
pub const FRAGMENT_RETRANSMIT_INTERVAL: Duration = Duration::from_secs(2);

/// A transfer with no inbound packet for this long is abandoned.
pub const TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// ── Keys ───────────────────────────────────────────────────────────────────────

/// Length of every cipher key and digest in the protocol.
pub const SESSION_KEY_LEN: usize = 16;
