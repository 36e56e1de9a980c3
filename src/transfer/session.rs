//! The transfer session state machine.
//!
//! Pure protocol logic for one file transfer, either side. The driver
//! feeds it received UDP payloads and clock ticks; it returns packets
//! to transmit and status/progress updates to surface. Ordering of the
//! handshake (sender first):
//!
//! ```text
//! sender                          receiver
//!   ping ──────────────────────────►
//!   ◄────────────────────────── pong
//!   sender-hello (nonce) ──────────►
//!   ◄─────────── sender-hello-ack + receiver-hello (nonce)
//!   receiver-hello-ack + basic-info ►
//!   ◄──────────────────── basic-info-ack
//!   data fragments ◄──────────────► fragment acks
//!   eof ───────────────────────────►
//!   ◄──────────────────────── eof-ack
//! ```
//!
//! Fragments flow under the fixed-width sliding window: an initial
//! window-wide burst, then one speculative fragment per watermark
//! advance, with periodic retransmission of unacknowledged in-window
//! fragments. The receiver always re-acknowledges a duplicate fragment
//! (its earlier ack may be the thing that was lost) but never rewrites
//! one.

use crate::config::{
    FRAGMENT_LEN, FRAGMENT_RETRANSMIT_INTERVAL, HANDSHAKE_TIMEOUT, PING_TIMEOUT,
    TRANSFER_IDLE_TIMEOUT,
};
use crate::crypto::{digest, tea, SessionKey};
use crate::error::TransferError;
use crate::events::TransferStatus;
use crate::transfer::store::FragmentFile;
use crate::transfer::window::SlidingWindow;
use crate::transfer::wire::{
    self, ConnectionEndpoint, ControlKind, ControlPacket, DataPacket, TAG_CONTROL, TAG_DATA,
};
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    Sender,
    Receiver,
}

/// Which address pair the UDP exchange currently targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Server-seen address, major ports.
    Direct,
    /// LAN address, minor ports.
    Lan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Sender: ping sent, waiting for pong or notify-ack.
    Connecting,
    /// Sender: hello sent, waiting for the receiver's hello.
    Hello,
    /// Receiver: sockets open, waiting for the sender to reach us.
    AwaitingPeer,
    /// Sender: metadata sent, waiting for its ack.
    SendingInfo,
    Transferring,
    /// Sender: all fragments acked, waiting for the eof ack.
    Eof,
    Completed,
    Cancelled,
    Failed,
}

impl TransferPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferPhase::Completed | TransferPhase::Cancelled | TransferPhase::Failed
        )
    }
}

/// Declarative side effects of one session step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    /// A complete UDP payload for the current path.
    Packet(Vec<u8>),
    Progress { bytes: u64, total: u64 },
    Status(TransferStatus),
    PathSwitched(PathKind),
}

pub struct TransferSession {
    role: TransferRole,
    phase: TransferPhase,
    local_id: u32,
    peer_id: u32,
    key: SessionKey,
    icon: u8,
    local: ConnectionEndpoint,
    remote: ConnectionEndpoint,
    path: PathKind,
    tried_fallback: bool,
    hello_nonce: u8,
    control_seq: u16,
    data_seq: u16,

    file: Option<FragmentFile>,
    dest_path: Option<PathBuf>,
    filename: String,
    file_len: u32,
    fragment_count: u32,
    file_digest: [u8; 16],
    name_digest: [u8; 16],
    window: SlidingWindow,
    /// Sender: one past the highest fragment ever transmitted.
    next_to_send: u32,
    bytes_done: u64,

    last_inbound: Instant,
    path_deadline: Instant,
    next_probe: Instant,
    last_retransmit: Instant,
}

impl TransferSession {
    /// Outbound transfer. Reads the file geometry and digests up front.
    #[allow(clippy::too_many_arguments)]
    pub fn sender(
        local_id: u32,
        peer_id: u32,
        key: SessionKey,
        local: ConnectionEndpoint,
        remote: ConnectionEndpoint,
        path: &std::path::Path,
        filename: String,
        now: Instant,
    ) -> Result<Self, TransferError> {
        let file = FragmentFile::open_read(path, FRAGMENT_LEN)?;
        let file_len = file.size() as u32;
        let fragment_count = file.fragment_count();
        let file_digest = digest::file_digest(path)?;
        let name_digest = digest::digest16(filename.as_bytes());
        Ok(Self {
            role: TransferRole::Sender,
            phase: TransferPhase::Connecting,
            local_id,
            peer_id,
            key,
            icon: 0,
            local,
            remote,
            path: Self::initial_path(&local, &remote),
            tried_fallback: false,
            hello_nonce: rand::random(),
            control_seq: 0,
            data_seq: 0,
            file: Some(file),
            dest_path: None,
            filename,
            file_len,
            fragment_count,
            file_digest,
            name_digest,
            window: SlidingWindow::new(fragment_count),
            next_to_send: 0,
            bytes_done: 0,
            last_inbound: now,
            path_deadline: now + HANDSHAKE_TIMEOUT,
            next_probe: now,
            last_retransmit: now,
        })
    }

    /// Inbound transfer. The destination file is created once the
    /// metadata packet arrives.
    pub fn receiver(
        local_id: u32,
        peer_id: u32,
        key: SessionKey,
        local: ConnectionEndpoint,
        remote: ConnectionEndpoint,
        dest: PathBuf,
        now: Instant,
    ) -> Self {
        Self {
            role: TransferRole::Receiver,
            phase: TransferPhase::AwaitingPeer,
            local_id,
            peer_id,
            key,
            icon: 0,
            local,
            remote,
            path: Self::initial_path(&local, &remote),
            tried_fallback: false,
            hello_nonce: rand::random(),
            control_seq: 0,
            data_seq: 0,
            file: None,
            dest_path: Some(dest),
            filename: String::new(),
            file_len: 0,
            fragment_count: 0,
            file_digest: [0; 16],
            name_digest: [0; 16],
            window: SlidingWindow::new(0),
            next_to_send: 0,
            bytes_done: 0,
            last_inbound: now,
            path_deadline: now + HANDSHAKE_TIMEOUT,
            next_probe: now,
            last_retransmit: now,
        }
    }

    fn initial_path(local: &ConnectionEndpoint, remote: &ConnectionEndpoint) -> PathKind {
        if remote.same_lan_as(local.public_ip) {
            PathKind::Lan
        } else {
            PathKind::Direct
        }
    }

    pub fn role(&self) -> TransferRole {
        self.role
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn path(&self) -> PathKind {
        self.path
    }

    /// Where packets for the current path go. Replies do not follow the
    /// inbound packet's source address: each side transmits toward its
    /// own path guess, so a sender-side fallback to the routed path
    /// connects only when the receiver's guess agrees.
    pub fn remote_addr(&self) -> SocketAddr {
        let v4 = match self.path {
            PathKind::Direct => SocketAddrV4::new(self.remote.public_ip, self.remote.major_port),
            PathKind::Lan => SocketAddrV4::new(self.remote.local_ip, self.remote.minor_port),
        };
        SocketAddr::V4(v4)
    }

    /// Refresh the peer's endpoint (from a notify-endpoint IM) and
    /// recompute the preferred path if the handshake has not finished.
    pub fn update_remote(&mut self, remote: ConnectionEndpoint) {
        self.remote = remote;
        if matches!(
            self.phase,
            TransferPhase::Connecting | TransferPhase::Hello | TransferPhase::AwaitingPeer
        ) && !self.tried_fallback
        {
            self.path = Self::initial_path(&self.local, &self.remote);
        }
    }

    /// Endpoint refresh delivered over the command channel. The
    /// receiver answers on UDP so the sender learns the path works.
    pub fn on_remote_notified(&mut self, remote: ConnectionEndpoint) -> Vec<SessionOutput> {
        self.update_remote(remote);
        if self.role == TransferRole::Receiver && !self.phase.is_terminal() {
            let ep = self.local_endpoint();
            vec![self.control(ControlKind::NotifyAck, 0, Some(&ep))]
        } else {
            Vec::new()
        }
    }

    // ── Packet builders ────────────────────────────────────────────────────────

    fn next_control_seq(&mut self) -> u16 {
        self.control_seq = self.control_seq.wrapping_add(1);
        self.control_seq
    }

    fn control(
        &mut self,
        kind: ControlKind,
        nonce: u8,
        endpoint: Option<&ConnectionEndpoint>,
    ) -> SessionOutput {
        let seq = self.next_control_seq();
        let plain = wire::encode_control(&self.key, kind, seq, self.icon, nonce, endpoint);
        let sealed = tea::encrypt(&plain, &self.key);
        SessionOutput::Packet(wire::encode_file_packet(
            TAG_CONTROL,
            self.local_id,
            self.peer_id,
            &sealed,
        ))
    }

    fn data(&self, packet: &DataPacket) -> SessionOutput {
        SessionOutput::Packet(wire::encode_file_packet(
            TAG_DATA,
            self.local_id,
            self.peer_id,
            &wire::encode_data_packet(packet),
        ))
    }

    fn local_endpoint(&self) -> ConnectionEndpoint {
        self.local
    }

    fn fragment(&mut self, index: u32) -> Result<SessionOutput, TransferError> {
        let file = self.file.as_mut().ok_or(TransferError::Cancelled)?;
        let payload = file.read_fragment(index)?;
        self.data_seq = self.data_seq.wrapping_add(1);
        let packet = DataPacket::DataInfo {
            seq: self.data_seq,
            index,
            offset: index * FRAGMENT_LEN,
            payload,
        };
        Ok(self.data(&packet))
    }

    fn basic_info(&self) -> SessionOutput {
        self.data(&DataPacket::BasicInfo {
            file_len: self.file_len,
            fragment_count: self.fragment_count,
            fragment_len: FRAGMENT_LEN,
            file_digest: self.file_digest,
            name_digest: self.name_digest,
            filename: self.filename.clone(),
        })
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────────

    /// Kick the session off once the driver's sockets are bound.
    pub fn start(&mut self, now: Instant) -> Vec<SessionOutput> {
        self.path_deadline = now + HANDSHAKE_TIMEOUT;
        self.next_probe = now + PING_TIMEOUT;
        match self.role {
            TransferRole::Sender => {
                info!(peer = self.peer_id, path = ?self.path, "transfer handshake started");
                let ep = self.local_endpoint();
                vec![self.control(ControlKind::Ping, 0, Some(&ep))]
            }
            TransferRole::Receiver => Vec::new(),
        }
    }

    /// Abort locally. The IM-level cancel notice is the engine's job.
    pub fn cancel(&mut self) -> Vec<SessionOutput> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        info!(peer = self.peer_id, "transfer cancelled");
        self.phase = TransferPhase::Cancelled;
        vec![SessionOutput::Status(TransferStatus::Canceled)]
    }

    fn fail(&mut self, why: impl std::fmt::Display) -> Vec<SessionOutput> {
        warn!(peer = self.peer_id, %why, "transfer failed");
        self.phase = TransferPhase::Failed;
        vec![SessionOutput::Status(TransferStatus::Failed)]
    }

    // ── Packet intake ──────────────────────────────────────────────────────────

    /// Process one UDP payload. Errors mean the packet was undecodable
    /// or inconsistent; the driver logs and carries on.
    pub fn on_packet(
        &mut self,
        raw: &[u8],
        now: Instant,
    ) -> Result<Vec<SessionOutput>, TransferError> {
        if self.phase.is_terminal() && self.phase != TransferPhase::Completed {
            return Ok(Vec::new());
        }
        let (envelope, inner) = wire::decode_file_packet(raw)?;
        if envelope.sender != self.peer_id {
            warn!(
                from = envelope.sender,
                expected = self.peer_id,
                "packet from unexpected peer dropped"
            );
            return Ok(Vec::new());
        }
        self.last_inbound = now;
        match envelope.tag {
            TAG_CONTROL => {
                let plain = tea::decrypt(inner, &self.key)?;
                let packet = wire::decode_control(&plain)?;
                if packet.key != self.key {
                    warn!(peer = self.peer_id, "control packet with wrong key dropped");
                    return Ok(Vec::new());
                }
                Ok(self.on_control(packet, now))
            }
            TAG_DATA => {
                let packet = wire::decode_data_packet(inner)?;
                self.on_data(packet, now)
            }
            other => {
                warn!(tag = other, "unknown file packet tag dropped");
                Ok(Vec::new())
            }
        }
    }

    fn on_control(&mut self, packet: ControlPacket, now: Instant) -> Vec<SessionOutput> {
        debug!(kind = ?packet.kind, seq = packet.seq, phase = ?self.phase, "control packet");
        match (self.role, packet.kind) {
            (TransferRole::Receiver, ControlKind::Ping) => {
                let ep = self.local_endpoint();
                vec![self.control(ControlKind::Pong, 0, Some(&ep))]
            }
            (TransferRole::Sender, ControlKind::Pong)
            | (TransferRole::Sender, ControlKind::NotifyAck) => {
                if self.phase != TransferPhase::Connecting {
                    return Vec::new();
                }
                self.phase = TransferPhase::Hello;
                self.path_deadline = now + HANDSHAKE_TIMEOUT;
                self.next_probe = now + PING_TIMEOUT;
                let nonce = self.hello_nonce;
                vec![self.control(ControlKind::SenderHello, nonce, None)]
            }
            (TransferRole::Receiver, ControlKind::SenderHello) => {
                // idempotent: a repeated hello gets the same two replies
                if self.phase == TransferPhase::AwaitingPeer {
                    self.phase = TransferPhase::Transferring;
                }
                let theirs = packet.nonce;
                let mine = self.hello_nonce;
                vec![
                    self.control(ControlKind::SenderHelloAck, theirs, None),
                    self.control(ControlKind::ReceiverHello, mine, None),
                ]
            }
            (TransferRole::Sender, ControlKind::SenderHelloAck) => {
                if packet.nonce != self.hello_nonce {
                    warn!(got = packet.nonce, "hello ack with wrong nonce ignored");
                }
                Vec::new()
            }
            (TransferRole::Sender, ControlKind::ReceiverHello) => {
                if self.phase != TransferPhase::Hello {
                    return Vec::new();
                }
                self.phase = TransferPhase::SendingInfo;
                self.last_retransmit = now;
                let theirs = packet.nonce;
                vec![
                    self.control(ControlKind::ReceiverHelloAck, theirs, None),
                    self.basic_info(),
                ]
            }
            (TransferRole::Receiver, ControlKind::ReceiverHelloAck) => {
                if packet.nonce != self.hello_nonce {
                    warn!(got = packet.nonce, "hello ack with wrong nonce ignored");
                }
                Vec::new()
            }
            (role, kind) => {
                debug!(?role, ?kind, "control packet out of place, ignored");
                Vec::new()
            }
        }
    }

    fn on_data(
        &mut self,
        packet: DataPacket,
        now: Instant,
    ) -> Result<Vec<SessionOutput>, TransferError> {
        match (self.role, packet) {
            (TransferRole::Receiver, DataPacket::BasicInfo {
                file_len,
                fragment_count,
                fragment_len,
                file_digest,
                name_digest,
                filename,
            }) => self.on_basic_info(
                file_len,
                fragment_count,
                fragment_len,
                file_digest,
                name_digest,
                filename,
            ),
            (TransferRole::Sender, DataPacket::BasicInfoAck) => self.on_basic_info_ack(now),
            (TransferRole::Receiver, DataPacket::DataInfo {
                seq,
                index,
                offset,
                payload,
            }) => self.on_data_info(seq, index, offset, &payload),
            (TransferRole::Sender, DataPacket::DataInfoAck { index, .. }) => {
                self.on_data_info_ack(index, now)
            }
            (TransferRole::Receiver, DataPacket::Eof { seq }) => self.on_eof(seq),
            (TransferRole::Sender, DataPacket::EofAck { .. }) => {
                if self.phase != TransferPhase::Eof {
                    return Ok(Vec::new());
                }
                info!(peer = self.peer_id, file = %self.filename, "transfer complete");
                self.phase = TransferPhase::Completed;
                Ok(vec![SessionOutput::Status(TransferStatus::Finished)])
            }
            (role, packet) => {
                debug!(?role, ?packet, "data packet out of place, ignored");
                Ok(Vec::new())
            }
        }
    }

    fn on_basic_info(
        &mut self,
        file_len: u32,
        fragment_count: u32,
        fragment_len: u32,
        file_digest: [u8; 16],
        name_digest: [u8; 16],
        filename: String,
    ) -> Result<Vec<SessionOutput>, TransferError> {
        let mut out = Vec::new();
        if self.file.is_none() {
            if fragment_len != FRAGMENT_LEN {
                warn!(fragment_len, "unsupported fragment length");
                return Ok(Vec::new());
            }
            let dest = self.dest_path.clone().ok_or(TransferError::Cancelled)?;
            let file = FragmentFile::create_write(&dest, file_len as u64, fragment_len)?;
            info!(
                peer = self.peer_id,
                file = %filename,
                bytes = file_len,
                fragments = fragment_count,
                "incoming transfer metadata"
            );
            self.file = Some(file);
            self.file_len = file_len;
            self.fragment_count = fragment_count;
            self.file_digest = file_digest;
            self.name_digest = name_digest;
            self.filename = filename;
            self.window = SlidingWindow::new(fragment_count);
            self.phase = TransferPhase::Transferring;
            out.push(SessionOutput::Status(TransferStatus::Transferring));
        }
        // the ack itself may have been lost, answer every copy
        out.push(self.data(&DataPacket::BasicInfoAck));
        Ok(out)
    }

    fn on_basic_info_ack(&mut self, now: Instant) -> Result<Vec<SessionOutput>, TransferError> {
        if self.phase != TransferPhase::SendingInfo {
            return Ok(Vec::new());
        }
        self.phase = TransferPhase::Transferring;
        self.last_retransmit = now;
        let mut out = vec![SessionOutput::Status(TransferStatus::Transferring)];
        if self.window.is_complete() {
            // zero-byte file: nothing to fragment
            self.phase = TransferPhase::Eof;
            let seq = self.data_seq;
            out.push(self.data(&DataPacket::Eof { seq }));
            return Ok(out);
        }
        // initial burst fills the window
        while self.next_to_send < self.window.window_end() {
            let index = self.next_to_send;
            out.push(self.fragment(index)?);
            self.next_to_send += 1;
        }
        Ok(out)
    }

    fn on_data_info(
        &mut self,
        seq: u16,
        index: u32,
        offset: u32,
        payload: &[u8],
    ) -> Result<Vec<SessionOutput>, TransferError> {
        if self.file.is_none() {
            warn!(index, "fragment before transfer metadata, dropped");
            return Ok(Vec::new());
        }
        if offset != index * FRAGMENT_LEN {
            warn!(index, offset, "fragment offset disagrees with its index");
            return Ok(Vec::new());
        }
        // ack first: a duplicate fragment usually means our ack died
        let mut out = vec![self.data(&DataPacket::DataInfoAck { seq, index })];
        if !self.window.mark(index) {
            debug!(index, "duplicate fragment re-acked");
            return Ok(out);
        }
        let file = self.file.as_mut().ok_or(TransferError::Cancelled)?;
        file.write_fragment(index, payload)?;
        self.window.advance();
        self.bytes_done += payload.len() as u64;
        out.push(SessionOutput::Progress {
            bytes: self.bytes_done,
            total: self.file_len as u64,
        });
        Ok(out)
    }

    fn on_data_info_ack(
        &mut self,
        index: u32,
        now: Instant,
    ) -> Result<Vec<SessionOutput>, TransferError> {
        if self.phase != TransferPhase::Transferring {
            return Ok(Vec::new());
        }
        if !self.window.mark(index) {
            debug!(index, "duplicate or stale fragment ack ignored");
            return Ok(Vec::new());
        }
        if let Some(file) = self.file.as_ref() {
            self.bytes_done += file.fragment_size(index) as u64;
        }
        self.window.advance();
        let mut out = vec![SessionOutput::Progress {
            bytes: self.bytes_done,
            total: self.file_len as u64,
        }];
        // each watermark advance frees window slots for new fragments
        while self.next_to_send < self.window.window_end() {
            let next = self.next_to_send;
            out.push(self.fragment(next)?);
            self.next_to_send += 1;
        }
        if self.window.is_complete() {
            self.phase = TransferPhase::Eof;
            self.last_retransmit = now;
            let seq = self.data_seq;
            out.push(self.data(&DataPacket::Eof { seq }));
        }
        Ok(out)
    }

    fn on_eof(&mut self, seq: u16) -> Result<Vec<SessionOutput>, TransferError> {
        let mut out = vec![self.data(&DataPacket::EofAck { seq })];
        if self.phase != TransferPhase::Transferring {
            // late duplicate after completion, the re-ack is enough
            return Ok(out);
        }
        if !self.window.is_complete() {
            warn!(
                watermark = self.window.watermark(),
                of = self.fragment_count,
                "eof before all fragments arrived, ignoring"
            );
            out.clear();
            return Ok(out);
        }
        if let Some(file) = self.file.as_mut() {
            file.sync()?;
        }
        if let Some(dest) = &self.dest_path {
            let actual = digest::file_digest(dest)?;
            if actual != self.file_digest {
                out.extend(self.fail(TransferError::DigestMismatch));
                return Ok(out);
            }
        }
        info!(peer = self.peer_id, file = %self.filename, "transfer complete");
        self.phase = TransferPhase::Completed;
        out.push(SessionOutput::Status(TransferStatus::Finished));
        Ok(out)
    }

    // ── Clock ──────────────────────────────────────────────────────────────────

    /// Periodic timer: handshake probing and fallback, fragment and
    /// control retransmission, idle abandonment.
    pub fn tick(&mut self, now: Instant) -> Vec<SessionOutput> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        if now.duration_since(self.last_inbound) >= TRANSFER_IDLE_TIMEOUT {
            return self.fail("peer went silent");
        }
        match self.phase {
            TransferPhase::Connecting | TransferPhase::Hello => self.tick_handshake(now),
            TransferPhase::SendingInfo => {
                if now.duration_since(self.last_retransmit) >= FRAGMENT_RETRANSMIT_INTERVAL {
                    self.last_retransmit = now;
                    vec![self.basic_info()]
                } else {
                    Vec::new()
                }
            }
            TransferPhase::Transferring if self.role == TransferRole::Sender => {
                if now.duration_since(self.last_retransmit) < FRAGMENT_RETRANSMIT_INTERVAL {
                    return Vec::new();
                }
                self.last_retransmit = now;
                let overdue = self.window.unmarked_below(self.next_to_send);
                let mut out = Vec::with_capacity(overdue.len());
                for index in overdue {
                    match self.fragment(index) {
                        Ok(packet) => out.push(packet),
                        Err(err) => return self.fail(err),
                    }
                }
                out
            }
            TransferPhase::Eof => {
                if now.duration_since(self.last_retransmit) >= FRAGMENT_RETRANSMIT_INTERVAL {
                    self.last_retransmit = now;
                    let seq = self.data_seq;
                    vec![self.data(&DataPacket::Eof { seq })]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn tick_handshake(&mut self, now: Instant) -> Vec<SessionOutput> {
        if now >= self.path_deadline {
            // the LAN shortcut gets one chance, then the routed path
            if self.path == PathKind::Lan && !self.tried_fallback {
                info!(peer = self.peer_id, "LAN path unresponsive, switching to routed path");
                self.tried_fallback = true;
                self.path = PathKind::Direct;
                self.phase = TransferPhase::Connecting;
                self.path_deadline = now + HANDSHAKE_TIMEOUT;
                self.next_probe = now + PING_TIMEOUT;
                let ep = self.local_endpoint();
                return vec![
                    SessionOutput::PathSwitched(PathKind::Direct),
                    self.control(ControlKind::Ping, 0, Some(&ep)),
                ];
            }
            return self.fail(TransferError::HandshakeTimeout);
        }
        if now >= self.next_probe {
            self.next_probe = now + PING_TIMEOUT;
            return match self.phase {
                TransferPhase::Connecting => {
                    let ep = self.local_endpoint();
                    vec![self.control(ControlKind::Ping, 0, Some(&ep))]
                }
                TransferPhase::Hello => {
                    let nonce = self.hello_nonce;
                    vec![self.control(ControlKind::SenderHello, nonce, None)]
                }
                _ => Vec::new(),
            };
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::time::Duration;

    const KEY: SessionKey = [0x5A; 16];
    const SENDER_ID: u32 = 1001;
    const RECEIVER_ID: u32 = 2002;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("lumiq_test")
            .join("session")
            .join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn endpoint(public: [u8; 4], local: [u8; 4]) -> ConnectionEndpoint {
        ConnectionEndpoint {
            method: 0,
            public_ip: Ipv4Addr::from(public),
            public_port: 4000,
            major_port: 4001,
            local_ip: Ipv4Addr::from(local),
            minor_port: 4002,
        }
    }

    fn make_pair(dir: &std::path::Path, data: &[u8]) -> (TransferSession, TransferSession) {
        let src = dir.join("src.bin");
        let dst = dir.join("dst.bin");
        std::fs::write(&src, data).unwrap();
        let now = Instant::now();
        // distinct public addresses: routed path from the start
        let sender_ep = endpoint([198, 51, 100, 1], [10, 0, 0, 1]);
        let receiver_ep = endpoint([203, 0, 113, 2], [10, 0, 0, 2]);
        let sender = TransferSession::sender(
            SENDER_ID,
            RECEIVER_ID,
            KEY,
            sender_ep,
            receiver_ep,
            &src,
            "src.bin".into(),
            now,
        )
        .unwrap();
        let receiver = TransferSession::receiver(
            RECEIVER_ID,
            SENDER_ID,
            KEY,
            receiver_ep,
            sender_ep,
            dst,
            now,
        );
        (sender, receiver)
    }

    fn packets(outputs: Vec<SessionOutput>) -> Vec<Vec<u8>> {
        outputs
            .into_iter()
            .filter_map(|o| match o {
                SessionOutput::Packet(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Shuttle packets between the two sessions until both queues
    /// drain. `drop_from_receiver` swallows the nth receiver packet
    /// each time it would be delivered.
    fn pump(
        sender: &mut TransferSession,
        receiver: &mut TransferSession,
        initial: Vec<Vec<u8>>,
        mut drop_from_receiver: impl FnMut(&[u8]) -> bool,
    ) {
        let now = Instant::now();
        let mut to_receiver = initial;
        let mut to_sender: Vec<Vec<u8>> = Vec::new();
        for _ in 0..10_000 {
            if to_receiver.is_empty() && to_sender.is_empty() {
                break;
            }
            for raw in std::mem::take(&mut to_receiver) {
                let outs = receiver.on_packet(&raw, now).unwrap();
                for p in packets(outs) {
                    if !drop_from_receiver(&p) {
                        to_sender.push(p);
                    }
                }
            }
            for raw in std::mem::take(&mut to_sender) {
                to_receiver.extend(packets(sender.on_packet(&raw, now).unwrap()));
            }
        }
    }

    #[test]
    fn full_transfer_reassembles_the_file() {
        let dir = test_dir("full");
        // 40 fragments: more than one window, so the burst must slide
        let data: Vec<u8> = (0..39_500u32).map(|i| (i % 241) as u8).collect();
        let (mut sender, mut receiver) = make_pair(&dir, &data);

        let now = Instant::now();
        let initial = packets(sender.start(now));
        assert_eq!(initial.len(), 1); // the ping
        pump(&mut sender, &mut receiver, initial, |_| false);

        assert_eq!(sender.phase(), TransferPhase::Completed);
        assert_eq!(receiver.phase(), TransferPhase::Completed);
        assert_eq!(std::fs::read(dir.join("dst.bin")).unwrap(), data);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_file_transfer_completes() {
        let dir = test_dir("empty");
        let (mut sender, mut receiver) = make_pair(&dir, &[]);
        let now = Instant::now();
        let initial = packets(sender.start(now));
        pump(&mut sender, &mut receiver, initial, |_| false);

        assert_eq!(sender.phase(), TransferPhase::Completed);
        assert_eq!(receiver.phase(), TransferPhase::Completed);
        assert_eq!(std::fs::read(dir.join("dst.bin")).unwrap().len(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn lost_fragment_ack_is_recovered_by_retransmission() {
        let dir = test_dir("lost_ack");
        // ten fragments
        let data = vec![7u8; 9_500];
        let (mut sender, mut receiver) = make_pair(&dir, &data);

        let now = Instant::now();
        let initial = packets(sender.start(now));
        // drop the first two acks for fragment index 3
        let mut dropped = 0;
        let drop_ack_3 = |dropped: &mut u32, raw: &[u8]| {
            let (env, inner) = wire::decode_file_packet(raw).unwrap();
            if env.tag == TAG_DATA {
                if let Ok(DataPacket::DataInfoAck { index: 3, .. }) = wire::decode_data_packet(inner)
                {
                    if *dropped < 2 {
                        *dropped += 1;
                        return true;
                    }
                }
            }
            false
        };
        pump(&mut sender, &mut receiver, initial, |raw| {
            drop_ack_3(&mut dropped, raw)
        });
        assert_eq!(dropped, 1);
        // everything except fragment 3 is acked; the watermark is stuck
        assert_eq!(sender.phase(), TransferPhase::Transferring);
        assert_eq!(sender.window.watermark(), 3);
        // receiver holds the complete file already
        assert_eq!(receiver.window.watermark(), 10);

        // the retransmit timer refires fragment 3; the duplicate's
        // re-ack is dropped a second time and nothing moves
        let later = Instant::now() + FRAGMENT_RETRANSMIT_INTERVAL + Duration::from_millis(10);
        let resent = packets(sender.tick(later));
        assert_eq!(resent.len(), 1);
        pump(&mut sender, &mut receiver, resent, |raw| {
            drop_ack_3(&mut dropped, raw)
        });
        assert_eq!(dropped, 2);
        assert_eq!(sender.window.watermark(), 3);

        // third attempt gets through and the watermark jumps to the end
        let final_try = later + FRAGMENT_RETRANSMIT_INTERVAL + Duration::from_millis(10);
        let resent = packets(sender.tick(final_try));
        assert_eq!(resent.len(), 1);
        pump(&mut sender, &mut receiver, resent, |_| false);

        assert_eq!(sender.phase(), TransferPhase::Completed);
        assert_eq!(receiver.phase(), TransferPhase::Completed);
        assert_eq!(std::fs::read(dir.join("dst.bin")).unwrap(), data);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn out_of_order_fragments_reassemble_correctly() {
        let dir = test_dir("ooo");
        let data: Vec<u8> = (0..5_000u32).map(|i| (i % 199) as u8).collect();
        let (mut sender, mut receiver) = make_pair(&dir, &data);

        let now = Instant::now();
        // walk the handshake by hand up to the fragment burst
        let ping = packets(sender.start(now));
        let pong = packets(receiver.on_packet(&ping[0], now).unwrap());
        let hello = packets(sender.on_packet(&pong[0], now).unwrap());
        let hello_replies = packets(receiver.on_packet(&hello[0], now).unwrap());
        let mut info = Vec::new();
        for raw in &hello_replies {
            info.extend(packets(sender.on_packet(raw, now).unwrap()));
        }
        // info = [receiver-hello-ack, basic-info]
        let mut burst = Vec::new();
        for raw in &info {
            burst.extend(packets(receiver.on_packet(raw, now).unwrap()));
        }
        // burst = [basic-info-ack]; feed it to the sender for fragments
        let mut fragments = Vec::new();
        for raw in &burst {
            fragments.extend(packets(sender.on_packet(raw, now).unwrap()));
        }
        assert_eq!(fragments.len(), 5);

        // deliver the burst in reverse order
        fragments.reverse();
        let mut acks = Vec::new();
        for raw in &fragments {
            acks.extend(packets(receiver.on_packet(raw, now).unwrap()));
        }
        assert_eq!(receiver.window.watermark(), 5);

        // drain the tail of the exchange
        let mut to_sender = acks;
        let mut to_receiver: Vec<Vec<u8>> = Vec::new();
        for _ in 0..100 {
            if to_sender.is_empty() && to_receiver.is_empty() {
                break;
            }
            for raw in std::mem::take(&mut to_sender) {
                to_receiver.extend(packets(sender.on_packet(&raw, now).unwrap()));
            }
            for raw in std::mem::take(&mut to_receiver) {
                to_sender.extend(packets(receiver.on_packet(&raw, now).unwrap()));
            }
        }
        assert_eq!(sender.phase(), TransferPhase::Completed);
        assert_eq!(std::fs::read(dir.join("dst.bin")).unwrap(), data);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupted_metadata_digest_fails_the_transfer() {
        let dir = test_dir("bad_digest");
        let data = vec![3u8; 2_500];
        let (mut sender, mut receiver) = make_pair(&dir, &data);
        let now = Instant::now();

        // walk the handshake to the metadata packet
        let ping = packets(sender.start(now));
        let pong = packets(receiver.on_packet(&ping[0], now).unwrap());
        let hello = packets(sender.on_packet(&pong[0], now).unwrap());
        let hello_replies = packets(receiver.on_packet(&hello[0], now).unwrap());
        let mut info = Vec::new();
        for raw in &hello_replies {
            info.extend(packets(sender.on_packet(raw, now).unwrap()));
        }
        // info = [receiver-hello-ack, basic-info]; rewrite the file
        // digest so the reassembled file can never verify
        let (env, inner) = wire::decode_file_packet(&info[1]).unwrap();
        let tampered = match wire::decode_data_packet(inner).unwrap() {
            DataPacket::BasicInfo {
                file_len,
                fragment_count,
                fragment_len,
                name_digest,
                filename,
                ..
            } => wire::encode_file_packet(
                TAG_DATA,
                env.sender,
                env.receiver,
                &wire::encode_data_packet(&DataPacket::BasicInfo {
                    file_len,
                    fragment_count,
                    fragment_len,
                    file_digest: [0xBD; 16],
                    name_digest,
                    filename,
                }),
            ),
            other => panic!("expected metadata, got {other:?}"),
        };
        assert!(packets(receiver.on_packet(&info[0], now).unwrap()).is_empty());
        let acks = packets(receiver.on_packet(&tampered, now).unwrap());
        let mut fragments = Vec::new();
        for raw in &acks {
            fragments.extend(packets(sender.on_packet(raw, now).unwrap()));
        }
        pump(&mut sender, &mut receiver, fragments, |_| false);

        // the receiver fails on the eof digest check but still acks the
        // eof, so the sender finishes cleanly
        assert_eq!(receiver.phase(), TransferPhase::Failed);
        assert_eq!(sender.phase(), TransferPhase::Completed);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn lan_path_falls_back_to_routed_then_fails() {
        let dir = test_dir("fallback");
        let src = dir.join("src.bin");
        std::fs::write(&src, b"data").unwrap();
        let now = Instant::now();
        // identical public addresses: LAN path preferred
        let shared = [198, 51, 100, 9];
        let mut sender = TransferSession::sender(
            SENDER_ID,
            RECEIVER_ID,
            KEY,
            endpoint(shared, [10, 0, 0, 1]),
            endpoint(shared, [10, 0, 0, 2]),
            &src,
            "src.bin".into(),
            now,
        )
        .unwrap();
        assert_eq!(sender.path(), PathKind::Lan);
        sender.start(now);

        let after_timeout = now + HANDSHAKE_TIMEOUT + Duration::from_millis(1);
        let outs = sender.tick(after_timeout);
        assert!(outs.contains(&SessionOutput::PathSwitched(PathKind::Direct)));
        assert_eq!(sender.path(), PathKind::Direct);
        assert_eq!(sender.phase(), TransferPhase::Connecting);

        // the routed path gets no answer either
        let after_second = after_timeout + HANDSHAKE_TIMEOUT + Duration::from_millis(1);
        let outs = sender.tick(after_second);
        assert!(outs.contains(&SessionOutput::Status(TransferStatus::Failed)));
        assert_eq!(sender.phase(), TransferPhase::Failed);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn handshake_reprobes_before_giving_up() {
        let dir = test_dir("reprobe");
        let data = vec![1u8; 100];
        let (mut sender, _receiver) = make_pair(&dir, &data);
        let now = Instant::now();
        sender.start(now);

        let probe_time = now + PING_TIMEOUT + Duration::from_millis(1);
        let outs = sender.tick(probe_time);
        assert_eq!(packets(outs).len(), 1); // a fresh ping
        assert_eq!(sender.phase(), TransferPhase::Connecting);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn cancel_is_terminal_and_idempotent() {
        let dir = test_dir("cancel");
        let (mut sender, _receiver) = make_pair(&dir, b"payload");
        sender.start(Instant::now());

        let outs = sender.cancel();
        assert_eq!(outs, vec![SessionOutput::Status(TransferStatus::Canceled)]);
        assert!(sender.phase().is_terminal());
        assert!(sender.cancel().is_empty());
        assert!(sender.tick(Instant::now() + Duration::from_secs(600)).is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn packets_from_the_wrong_peer_are_dropped() {
        let dir = test_dir("wrong_peer");
        let (mut sender, _receiver) = make_pair(&dir, b"data");
        let now = Instant::now();
        sender.start(now);

        let stray = wire::encode_file_packet(TAG_DATA, 31337, SENDER_ID, &[0u8; 8]);
        let outs = sender.on_packet(&stray, now).unwrap();
        assert!(outs.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tampered_control_packet_is_rejected() {
        let dir = test_dir("tampered");
        let (mut sender, mut receiver) = make_pair(&dir, b"data");
        let now = Instant::now();
        let mut ping = packets(sender.start(now)).remove(0);
        let last = ping.len() - 1;
        ping[last] ^= 0xFF;
        assert!(receiver.on_packet(&ping, now).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
