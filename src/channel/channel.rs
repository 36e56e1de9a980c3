//! The command channel state machine.
//!
//! Owns everything about command delivery except the socket:
//!
//! - sequence numbering (randomly seeded, wrapping);
//! - body encryption under the password key before login and the
//!   session key after;
//! - the pending-ack queue with timed retransmission;
//! - duplicate suppression for server pushes;
//! - the pre-login frame queue, replayed in order once login completes.
//!
//! The engine calls [`send`](CommandChannel::send) and transmits the
//! returned frame, feeds every received frame to
//! [`on_frame_received`](CommandChannel::on_frame_received), and calls
//! [`tick`](CommandChannel::tick) on the resend interval. Transmission
//! failures are the engine's problem; a pending entry stays queued
//! either way and the resend scan covers the loss.

use crate::channel::command::{Command, LinkState};
use crate::channel::dedup::DuplicateWindow;
use crate::channel::pending::{DeliveryFailure, PendingCommand, PendingQueue};
use crate::codec::frame;
use crate::config::{COMMAND_RESEND_TIMEOUT, MAX_COMMAND_RESENDS};
use crate::crypto::{tea, SessionKey};
use crate::error::ChannelError;
use rand::Rng;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, warn};

/// An encoded frame ready for the transport.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub command: Command,
    pub seq: u16,
    pub bytes: Vec<u8>,
}

/// What a received frame dispatched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A server-initiated push, decrypted and dedup-checked.
    Push {
        command: Command,
        seq: u16,
        body: Vec<u8>,
    },
    /// A reply. `was_pending` is false for unsolicited replies, which
    /// are still dispatched so upper layers can log them.
    Reply {
        command: Command,
        seq: u16,
        body: Vec<u8>,
        was_pending: bool,
    },
}

/// Output of a resend-interval tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub resend: Vec<OutboundFrame>,
    pub failed: Vec<DeliveryFailure>,
}

pub struct CommandChannel {
    state: LinkState,
    /// Stream transports get length-prefixed frames.
    stream_mode: bool,
    /// Password key before login, session key after.
    key: SessionKey,
    send_seq: u16,
    pending: PendingQueue,
    dedup: DuplicateWindow,
    prelogin: VecDeque<Vec<u8>>,
}

impl CommandChannel {
    /// `login_key` is the derived password key; it encrypts the login
    /// exchange and is replaced by the server-issued session key.
    pub fn new(login_key: SessionKey, stream_mode: bool) -> Self {
        Self {
            state: LinkState::Disconnected,
            stream_mode,
            key: login_key,
            // random start so a fresh connection's sequences do not
            // collide with stragglers from the previous one
            send_seq: rand::thread_rng().gen(),
            pending: PendingQueue::new(),
            dedup: DuplicateWindow::new(),
            prelogin: VecDeque::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn next_seq(&mut self) -> u16 {
        self.send_seq = self.send_seq.wrapping_add(1);
        self.send_seq
    }

    fn encode(&self, command: Command, seq: u16, cipher_body: &[u8]) -> Vec<u8> {
        if self.stream_mode {
            frame::encode_stream(command.code(), seq, cipher_body)
        } else {
            frame::encode_datagram(command.code(), seq, cipher_body)
        }
    }

    /// Encrypt and frame `body`, assigning the next sequence number.
    /// With `needs_ack` the frame is also parked in the pending queue.
    pub fn send(&mut self, command: Command, body: &[u8], needs_ack: bool) -> OutboundFrame {
        let seq = self.next_seq();
        self.send_with_seq(command, seq, body, needs_ack)
    }

    /// Like [`send`](Self::send) but with a caller-chosen sequence
    /// number, used when acknowledging a server push under its seq.
    pub fn send_with_seq(
        &mut self,
        command: Command,
        seq: u16,
        body: &[u8],
        needs_ack: bool,
    ) -> OutboundFrame {
        let cipher_body = tea::encrypt(body, &self.key);
        let bytes = self.encode(command, seq, &cipher_body);
        if needs_ack {
            self.pending.insert(PendingCommand {
                command,
                seq,
                frame: bytes.clone(),
                sent_at: Instant::now(),
                resend_count: 0,
            });
        }
        debug!(seq, cmd = ?command, len = bytes.len(), "command framed");
        OutboundFrame {
            command,
            seq,
            bytes,
        }
    }

    /// Note that the login command is on the wire.
    pub fn login_sent(&mut self) {
        self.state = LinkState::AwaitingLoginReply;
    }

    /// Install the server-issued session key and release the frames
    /// that arrived before login completed, in arrival order. The
    /// caller replays them through
    /// [`on_frame_received`](Self::on_frame_received).
    pub fn complete_login(&mut self, session_key: SessionKey) -> Vec<Vec<u8>> {
        self.state = LinkState::LoggedIn;
        self.key = session_key;
        self.prelogin.drain(..).collect()
    }

    /// Drop all delivery state and return to `Disconnected`.
    pub fn reset(&mut self) {
        self.state = LinkState::Disconnected;
        self.pending.clear();
        self.dedup.clear();
        self.prelogin.clear();
    }

    /// Process one datagram-shaped frame.
    ///
    /// Returns at most one event. `Ok(None)` means the frame was
    /// consumed without dispatch (queued pre-login, or a duplicate).
    /// Errors are per-frame: the caller logs and drops, never tears
    /// down the connection.
    pub fn on_frame_received(&mut self, raw: &[u8]) -> Result<Option<ChannelEvent>, ChannelError> {
        let frame = frame::decode_datagram(raw)?;
        let command = Command::from_code(frame.header.command);
        let seq = frame.header.seq;

        // before login completes only the login reply may proceed;
        // everything else waits for the session key
        if self.state != LinkState::LoggedIn && command != Command::Login {
            debug!(seq, cmd = ?command, "queued frame until login completes");
            self.prelogin.push_back(raw.to_vec());
            return Ok(None);
        }

        if command.is_server_push() {
            if self.dedup.check_and_set(seq) {
                warn!(seq, cmd = ?command, "duplicate push dropped");
                return Ok(None);
            }
            let body = tea::decrypt(frame.body, &self.key)?;
            return Ok(Some(ChannelEvent::Push { command, seq, body }));
        }

        let was_pending = self.pending.take(seq).is_some();
        if !was_pending {
            debug!(seq, cmd = ?command, "reply without a pending command");
        }
        let body = tea::decrypt(frame.body, &self.key)?;
        Ok(Some(ChannelEvent::Reply {
            command,
            seq,
            body,
            was_pending,
        }))
    }

    /// Resend-interval scan.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let scan = self
            .pending
            .scan(now, COMMAND_RESEND_TIMEOUT, MAX_COMMAND_RESENDS);
        TickOutcome {
            resend: scan
                .resend
                .into_iter()
                .map(|(seq, bytes)| OutboundFrame {
                    // the frame is retransmitted verbatim; command kind
                    // only matters for logging here
                    command: Command::Other(0),
                    seq,
                    bytes,
                })
                .collect(),
            failed: scan.failed,
        }
    }
}
