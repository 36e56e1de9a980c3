//! The connection engine.
//!
//! One task owns the server transport and the command channel; all
//! protocol work funnels through it, so delivery state never needs a
//! lock. The loop:
//!
//! - connects (UDP datagrams or a TCP stream), sends the login command
//!   and completes the session-key switch on its reply;
//! - feeds every inbound frame to the [`CommandChannel`] and dispatches
//!   the resulting replies and pushes;
//! - runs the resend scan and the keep-alive clock;
//! - executes caller commands (messages, transfer offers and answers);
//! - negotiates file transfers over IM payloads and spawns one
//!   [`TransferDriver`](crate::transfer::driver::TransferDriver) task
//!   per accepted transfer.
//!
//! A failed login, an undeliverable keep-alive or a closed server
//! connection is fatal: the engine reports `ConnectionLost` and
//! returns. Transient datagram errors (an ICMP refusal surfacing on the
//! connected socket) are logged and left to the resend scan.

use crate::channel::command::{self, Command, LinkState, LoginReply};
use crate::channel::{ChannelEvent, CommandChannel, OutboundFrame};
use crate::codec::cursor::Reader;
use crate::codec::StreamAssembler;
use crate::config::{KEEP_ALIVE_INTERVAL, MAX_PACKET_SIZE, RESEND_SCAN_INTERVAL};
use crate::crypto::{digest, random_session_key, SessionKey};
use crate::error::ChannelError;
use crate::events::{EngineCommand, EngineEvent, TransferId, TransferStatus};
use crate::transfer::driver::{DriverMsg, SocketPair, TransferDriver};
use crate::transfer::session::TransferSession;
use crate::transfer::wire::{self, ConnectionEndpoint, ImPayload};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ── Public surface ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub server: SocketAddr,
    pub user_id: u32,
    pub password: String,
    /// Stream transport instead of datagrams.
    pub use_tcp: bool,
}

/// Cheap cloneable handle for feeding commands to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub fn new(tx: mpsc::UnboundedSender<EngineCommand>) -> Self {
        Self { tx }
    }

    pub fn command(&self, cmd: EngineCommand) -> Result<()> {
        self.tx.send(cmd).map_err(|_| anyhow::anyhow!("engine stopped"))
    }

    pub fn send_message(&self, to: u32, text: impl Into<String>) -> Result<()> {
        self.command(EngineCommand::SendMessage {
            to,
            text: text.into(),
        })
    }

    pub fn offer_file(&self, to: u32, path: impl Into<PathBuf>) -> Result<()> {
        self.command(EngineCommand::OfferFile {
            to,
            path: path.into(),
        })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(EngineCommand::Shutdown)
    }
}

// ── Transport ──────────────────────────────────────────────────────────────────

enum Transport {
    Udp(UdpSocket),
    Tcp {
        stream: TcpStream,
        assembler: StreamAssembler,
    },
}

impl Transport {
    async fn connect(server: SocketAddr, use_tcp: bool) -> Result<Self> {
        if use_tcp {
            let stream = TcpStream::connect(server)
                .await
                .with_context(|| format!("connecting to {server}"))?;
            Ok(Transport::Tcp {
                stream,
                assembler: StreamAssembler::new(),
            })
        } else {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket
                .connect(server)
                .await
                .with_context(|| format!("connecting to {server}"))?;
            Ok(Transport::Udp(socket))
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Udp(socket) => {
                socket.send(bytes).await?;
                Ok(())
            }
            Transport::Tcp { stream, .. } => stream.write_all(bytes).await,
        }
    }

    async fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Udp(socket) => socket.recv(buf).await,
            Transport::Tcp { stream, .. } => stream.read(buf).await,
        }
    }

    fn is_stream(&self) -> bool {
        matches!(self, Transport::Tcp { .. })
    }

    /// Turn a raw read into zero or more datagram-shaped frames.
    fn ingest(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        match self {
            Transport::Udp(_) => vec![bytes.to_vec()],
            Transport::Tcp { assembler, .. } => {
                assembler.push(bytes);
                let mut frames = Vec::new();
                while let Some(frame) = assembler.next_frame() {
                    frames.push(frame);
                }
                frames
            }
        }
    }
}

// ── Transfer bookkeeping ───────────────────────────────────────────────────────

enum SlotState {
    /// We offered a file and wait for the peer's answer.
    OfferedOut { path: PathBuf },
    /// The peer offered a file and waits for our answer.
    OfferedIn { remote: ConnectionEndpoint },
    Running { msgs: mpsc::UnboundedSender<DriverMsg> },
}

struct TransferSlot {
    peer: u32,
    filename: String,
    state: SlotState,
}

// ── Engine ─────────────────────────────────────────────────────────────────────

struct EngineState {
    user_id: u32,
    password_key: SessionKey,
    channel: CommandChannel,
    events: mpsc::UnboundedSender<EngineEvent>,
    transfers: HashMap<TransferId, TransferSlot>,
    next_transfer_id: TransferId,
    public_ip: Ipv4Addr,
    public_port: u16,
    local_ip: Ipv4Addr,
}

/// Run the protocol engine until shutdown or a fatal connection error.
pub async fn run_engine(
    config: EngineConfig,
    mut commands: mpsc::UnboundedReceiver<EngineCommand>,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> Result<()> {
    let password_key = digest::password_key(&config.password);
    let mut transport = Transport::connect(config.server, config.use_tcp).await?;
    let mut st = EngineState {
        user_id: config.user_id,
        password_key,
        channel: CommandChannel::new(password_key, config.use_tcp),
        events,
        transfers: HashMap::new(),
        next_transfer_id: 0,
        public_ip: Ipv4Addr::UNSPECIFIED,
        public_port: 0,
        local_ip: detect_local_ip(config.server),
    };

    let login = st.channel.send(
        Command::Login,
        &command::login_body(&st.password_key, command::STATUS_ONLINE),
        true,
    );
    transmit(&mut transport, &login.bytes, "login").await?;
    st.channel.login_sent();
    info!(user = st.user_id, server = %config.server, "login sent");

    let mut resend = tokio::time::interval(RESEND_SCAN_INTERVAL);
    resend.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first interval tick fires immediately; skip it
    resend.reset();
    keep_alive.reset();

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let mut outgoing: Vec<OutboundFrame> = Vec::new();
        tokio::select! {
            received = transport.recv(&mut buf) => {
                match received {
                    Ok(0) if transport.is_stream() => {
                        let _ = st.events.send(EngineEvent::ConnectionLost {
                            reason: "server closed the connection".into(),
                        });
                        bail!("server closed the connection");
                    }
                    Ok(n) => {
                        for raw in transport.ingest(&buf[..n]) {
                            st.process_frame(&raw, &mut outgoing).await?;
                        }
                    }
                    // a connected datagram socket surfaces ICMP
                    // unreachable here; the resend scan covers the gap
                    Err(err) if !transport.is_stream() => {
                        warn!(%err, "transient datagram error ignored");
                    }
                    Err(err) => {
                        let _ = st.events.send(EngineEvent::ConnectionLost {
                            reason: err.to_string(),
                        });
                        return Err(err).context("server transport");
                    }
                }
            }
            _ = resend.tick() => {
                let outcome = st.channel.tick(Instant::now());
                for frame in outcome.resend {
                    transmit(&mut transport, &frame.bytes, "retransmit").await?;
                }
                st.handle_failures(outcome.failed)?;
            }
            _ = keep_alive.tick() => {
                if st.channel.state() == LinkState::LoggedIn {
                    let frame = st.channel.send(
                        Command::KeepAlive,
                        &command::keep_alive_body(st.user_id),
                        true,
                    );
                    outgoing.push(frame);
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    None | Some(EngineCommand::Shutdown) => {
                        st.shutdown(&mut outgoing);
                        for frame in outgoing {
                            let _ = transport.send(&frame.bytes).await;
                        }
                        info!(user = st.user_id, "engine shut down");
                        return Ok(());
                    }
                    Some(cmd) => st.handle_command(cmd, &mut outgoing).await,
                }
            }
        }
        for frame in outgoing {
            transmit(&mut transport, &frame.bytes, "command frame").await?;
        }
    }
}

/// A send failure on a datagram transport is left to the resend scan;
/// on a stream it means the connection is gone.
async fn transmit(transport: &mut Transport, bytes: &[u8], what: &str) -> Result<()> {
    match transport.send(bytes).await {
        Ok(()) => Ok(()),
        Err(err) if !transport.is_stream() => {
            warn!(%err, what, "datagram send failed, the resend scan covers it");
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("sending {what}")),
    }
}

fn detect_local_ip(server: SocketAddr) -> Ipv4Addr {
    let probed = std::net::UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect(server)?;
        socket.local_addr()
    });
    match probed {
        Ok(SocketAddr::V4(addr)) => *addr.ip(),
        _ => Ipv4Addr::LOCALHOST,
    }
}

impl EngineState {
    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn local_endpoint(&self, major_port: u16, minor_port: u16) -> ConnectionEndpoint {
        ConnectionEndpoint {
            method: 0,
            public_ip: self.public_ip,
            public_port: self.public_port,
            major_port,
            local_ip: self.local_ip,
            minor_port,
        }
    }

    /// One frame off the wire. Fatal errors (rejected login) bubble up;
    /// everything else is logged and swallowed.
    async fn process_frame(&mut self, raw: &[u8], out: &mut Vec<OutboundFrame>) -> Result<()> {
        let event = match self.channel.on_frame_received(raw) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!(%err, "undecodable frame dropped");
                return Ok(());
            }
        };
        match event {
            ChannelEvent::Reply {
                command: Command::Login,
                body,
                ..
            } => self.complete_login(&body, out).await,
            other => self.dispatch(other, out).await,
        }
    }

    async fn complete_login(&mut self, body: &[u8], out: &mut Vec<OutboundFrame>) -> Result<()> {
        if self.channel.state() == LinkState::LoggedIn {
            debug!("duplicate login reply ignored");
            return Ok(());
        }
        let reply = LoginReply::decode(body).context("login failed")?;
        self.public_ip = reply.public_ip;
        self.public_port = reply.public_port;
        let replay = self.channel.complete_login(reply.session_key);
        info!(
            user = self.user_id,
            public_ip = %reply.public_ip,
            public_port = reply.public_port,
            queued = replay.len(),
            "logged in"
        );
        self.emit(EngineEvent::LoggedIn {
            public_ip: reply.public_ip,
            public_port: reply.public_port,
        });
        // frames that arrived before the session key, in arrival order
        for raw in replay {
            match self.channel.on_frame_received(&raw) {
                Ok(Some(event)) => self.dispatch(event, out).await?,
                Ok(None) => {}
                Err(err) => warn!(%err, "queued frame dropped on replay"),
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, event: ChannelEvent, out: &mut Vec<OutboundFrame>) -> Result<()> {
        match event {
            ChannelEvent::Push { command, seq, body } => {
                // pushes are acknowledged under the server's sequence
                out.push(self.channel.send_with_seq(command, seq, &[], false));
                match command {
                    Command::ReceiveMessage => self.on_message_push(&body).await,
                    Command::SystemNotice => {
                        let text = String::from_utf8_lossy(&body).into_owned();
                        self.emit(EngineEvent::SystemNotice { text });
                    }
                    Command::BuddyStatusChange => {
                        let mut r = Reader::new(&body);
                        match (r.get_u32(), r.get_u8()) {
                            (Ok(id), Ok(status)) => {
                                self.emit(EngineEvent::BuddyStatusChanged { id, status });
                            }
                            _ => warn!(seq, "malformed buddy status push"),
                        }
                    }
                    other => debug!(?other, seq, "unhandled push"),
                }
                Ok(())
            }
            ChannelEvent::Reply {
                command,
                seq,
                was_pending,
                ..
            } => {
                debug!(?command, seq, was_pending, "reply");
                Ok(())
            }
        }
    }

    async fn on_message_push(&mut self, body: &[u8]) {
        let (envelope, payload) = match wire::decode_im(body) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(%err, "malformed message push dropped");
                return;
            }
        };
        let peer = envelope.sender;
        match payload {
            ImPayload::Text(text) => {
                self.emit(EngineEvent::MessageReceived { from: peer, text });
            }
            ImPayload::TransferRequest {
                endpoint,
                size,
                filename,
            } => {
                let id = self.next_transfer_id;
                self.next_transfer_id += 1;
                info!(id, peer, file = %filename, size, "incoming transfer offer");
                self.transfers.insert(
                    id,
                    TransferSlot {
                        peer,
                        filename: filename.clone(),
                        state: SlotState::OfferedIn { remote: endpoint },
                    },
                );
                self.emit(EngineEvent::TransferAdded {
                    id,
                    peer,
                    filename,
                    size: size as u64,
                    inbound: true,
                });
                self.emit(EngineEvent::TransferStatusChanged {
                    id,
                    status: TransferStatus::Waiting,
                });
            }
            ImPayload::TransferAccept { key, endpoint } => {
                self.start_outbound(peer, key, endpoint).await;
            }
            ImPayload::TransferReject => {
                if let Some(id) = self.find_slot(peer, |s| matches!(s, SlotState::OfferedOut { .. }))
                {
                    info!(id, peer, "transfer rejected by peer");
                    self.remove_slot(id, TransferStatus::Canceled);
                }
            }
            ImPayload::TransferNotify { endpoint } => {
                if let Some(id) = self.find_slot(peer, |s| matches!(s, SlotState::Running { .. })) {
                    if let Some(TransferSlot {
                        state: SlotState::Running { msgs },
                        ..
                    }) = self.transfers.get(&id)
                    {
                        let _ = msgs.send(DriverMsg::RemoteNotified(endpoint));
                    }
                }
            }
            ImPayload::TransferCancel => {
                if let Some(id) = self.find_slot(peer, |_| true) {
                    info!(id, peer, "transfer cancelled by peer");
                    match &self.transfers[&id].state {
                        SlotState::Running { msgs } => {
                            // the driver emits the status and removal
                            let _ = msgs.send(DriverMsg::Cancel);
                        }
                        _ => self.remove_slot(id, TransferStatus::Canceled),
                    }
                }
            }
        }
    }

    /// The peer accepted our offer: bind sockets, tell it where we
    /// listen, start the sender session.
    async fn start_outbound(&mut self, peer: u32, key: SessionKey, remote: ConnectionEndpoint) {
        let Some(id) = self.find_slot(peer, |s| matches!(s, SlotState::OfferedOut { .. })) else {
            debug!(peer, "transfer accept without a matching offer");
            return;
        };
        let path = match &self.transfers[&id].state {
            SlotState::OfferedOut { path } => path.clone(),
            _ => return,
        };
        let sockets = match SocketPair::bind().await {
            Ok(sockets) => sockets,
            Err(err) => {
                warn!(id, %err, "transfer socket bind failed");
                self.remove_slot(id, TransferStatus::Failed);
                return;
            }
        };
        let local = match (sockets.major_port(), sockets.minor_port()) {
            (Ok(major), Ok(minor)) => self.local_endpoint(major, minor),
            _ => {
                self.remove_slot(id, TransferStatus::Failed);
                return;
            }
        };
        let filename = self.transfers[&id].filename.clone();
        let session = match TransferSession::sender(
            self.user_id,
            peer,
            key,
            local,
            remote,
            &path,
            filename,
            Instant::now(),
        ) {
            Ok(session) => session,
            Err(err) => {
                warn!(id, %err, "could not open the offered file");
                self.remove_slot(id, TransferStatus::Failed);
                return;
            }
        };
        self.spawn_driver(id, session, sockets);
    }

    fn spawn_driver(&mut self, id: TransferId, session: TransferSession, sockets: SocketPair) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let driver = TransferDriver::new(id, session, sockets, msg_rx, self.events.clone());
        tokio::spawn(async move {
            if let Err(err) = driver.run().await {
                warn!(id, %err, "transfer driver error");
            }
        });
        if let Some(slot) = self.transfers.get_mut(&id) {
            slot.state = SlotState::Running { msgs: msg_tx };
        }
    }

    fn find_slot(&self, peer: u32, matching: impl Fn(&SlotState) -> bool) -> Option<TransferId> {
        self.transfers
            .iter()
            .filter(|(_, slot)| slot.peer == peer && matching(&slot.state))
            .map(|(id, _)| *id)
            .min()
    }

    fn remove_slot(&mut self, id: TransferId, status: TransferStatus) {
        if self.transfers.remove(&id).is_some() {
            self.emit(EngineEvent::TransferStatusChanged { id, status });
            self.emit(EngineEvent::TransferRemoved { id });
        }
    }

    async fn handle_command(&mut self, cmd: EngineCommand, out: &mut Vec<OutboundFrame>) {
        if self.channel.state() != LinkState::LoggedIn {
            warn!(?cmd, "command before login completed, dropped");
            return;
        }
        match cmd {
            EngineCommand::SendMessage { to, text } => {
                let body = wire::encode_im(self.user_id, to, &ImPayload::Text(text));
                out.push(self.channel.send(Command::SendMessage, &body, true));
            }
            EngineCommand::OfferFile { to, path } => {
                let (filename, size) = match file_facts(&path) {
                    Ok(facts) => facts,
                    Err(err) => {
                        warn!(path = %path.display(), %err, "cannot offer file");
                        return;
                    }
                };
                let id = self.next_transfer_id;
                self.next_transfer_id += 1;
                // ports are zero until sockets exist; the notify message
                // delivers the real ones after the peer accepts
                let endpoint = self.local_endpoint(0, 0);
                let body = wire::encode_im(
                    self.user_id,
                    to,
                    &ImPayload::TransferRequest {
                        endpoint,
                        size: size as u32,
                        filename: filename.clone(),
                    },
                );
                out.push(self.channel.send(Command::SendMessage, &body, true));
                self.transfers.insert(
                    id,
                    TransferSlot {
                        peer: to,
                        filename: filename.clone(),
                        state: SlotState::OfferedOut { path },
                    },
                );
                info!(id, peer = to, file = %filename, size, "transfer offered");
                self.emit(EngineEvent::TransferAdded {
                    id,
                    peer: to,
                    filename,
                    size,
                    inbound: false,
                });
                self.emit(EngineEvent::TransferStatusChanged {
                    id,
                    status: TransferStatus::Waiting,
                });
            }
            EngineCommand::AcceptTransfer { id, dest } => {
                self.accept_transfer(id, dest, out).await;
            }
            EngineCommand::RejectTransfer { id } => {
                let Some(slot) = self.transfers.get(&id) else { return };
                if matches!(slot.state, SlotState::OfferedIn { .. }) {
                    let peer = slot.peer;
                    let body = wire::encode_im(self.user_id, peer, &ImPayload::TransferReject);
                    out.push(self.channel.send(Command::SendMessage, &body, true));
                    self.remove_slot(id, TransferStatus::Canceled);
                }
            }
            EngineCommand::CancelTransfer { id } => {
                let Some(slot) = self.transfers.get(&id) else { return };
                let peer = slot.peer;
                let body = wire::encode_im(self.user_id, peer, &ImPayload::TransferCancel);
                out.push(self.channel.send(Command::SendMessage, &body, true));
                match &slot.state {
                    SlotState::Running { msgs } => {
                        let _ = msgs.send(DriverMsg::Cancel);
                        self.transfers.remove(&id);
                    }
                    _ => self.remove_slot(id, TransferStatus::Canceled),
                }
            }
            EngineCommand::Shutdown => unreachable!("handled by the select loop"),
        }
    }

    /// Accept an inbound offer: bind sockets, pick a fresh transfer
    /// key, answer over IM and start the receiver session.
    async fn accept_transfer(
        &mut self,
        id: TransferId,
        dest: PathBuf,
        out: &mut Vec<OutboundFrame>,
    ) {
        let Some(slot) = self.transfers.get(&id) else {
            warn!(id, "accept for unknown transfer");
            return;
        };
        let SlotState::OfferedIn { remote } = &slot.state else {
            warn!(id, "accept for a transfer not awaiting one");
            return;
        };
        let remote = *remote;
        let peer = slot.peer;
        let sockets = match SocketPair::bind().await {
            Ok(sockets) => sockets,
            Err(err) => {
                warn!(id, %err, "transfer socket bind failed");
                self.remove_slot(id, TransferStatus::Failed);
                return;
            }
        };
        let local = match (sockets.major_port(), sockets.minor_port()) {
            (Ok(major), Ok(minor)) => self.local_endpoint(major, minor),
            _ => {
                self.remove_slot(id, TransferStatus::Failed);
                return;
            }
        };
        let key = random_session_key();
        let body = wire::encode_im(
            self.user_id,
            peer,
            &ImPayload::TransferAccept {
                key,
                endpoint: local,
            },
        );
        out.push(self.channel.send(Command::SendMessage, &body, true));
        let session =
            TransferSession::receiver(self.user_id, peer, key, local, remote, dest, Instant::now());
        info!(id, peer, "transfer accepted");
        self.spawn_driver(id, session, sockets);
    }

    /// Delivery failures: login and keep-alive are fatal, the rest are
    /// surfaced and forgotten.
    fn handle_failures(&mut self, failed: Vec<crate::channel::DeliveryFailure>) -> Result<()> {
        for failure in failed {
            match failure.command {
                Command::Login | Command::KeepAlive => {
                    let reason = match failure.command {
                        Command::Login => "login went unanswered",
                        _ => "keep-alive went unanswered",
                    };
                    let _ = self.events.send(EngineEvent::ConnectionLost {
                        reason: reason.into(),
                    });
                    return Err(ChannelError::DeliveryFailed {
                        command: failure.command.code(),
                        seq: failure.seq,
                        resends: failure.resends,
                    })
                    .context(reason);
                }
                command => {
                    warn!(?command, seq = failure.seq, "command delivery failed");
                    self.emit(EngineEvent::CommandFailed {
                        command,
                        seq: failure.seq,
                    });
                }
            }
        }
        Ok(())
    }

    fn shutdown(&mut self, out: &mut Vec<OutboundFrame>) {
        for slot in self.transfers.values() {
            if let SlotState::Running { msgs } = &slot.state {
                let _ = msgs.send(DriverMsg::Cancel);
            }
        }
        self.transfers.clear();
        if self.channel.state() == LinkState::LoggedIn {
            let key = self.password_key;
            out.push(self.channel.send(Command::Logout, &key, false));
        }
        self.channel.reset();
    }
}

fn file_facts(path: &std::path::Path) -> std::io::Result<(String, u64)> {
    let meta = std::fs::metadata(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    Ok((filename, meta.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame;
    use crate::crypto::tea;
    use std::time::Duration;

    const PASSWORD: &str = "hunter2";
    const USER: u32 = 9_001;
    const SESSION_KEY: SessionKey = [0x31; 16];

    struct MockServer {
        socket: UdpSocket,
        client: Option<SocketAddr>,
    }

    impl MockServer {
        async fn bind() -> Self {
            Self {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
                client: None,
            }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        /// Receive the next frame with the given command, skipping
        /// retransmissions of others.
        async fn recv_command(&mut self, command: Command, key: &SessionKey) -> (u16, Vec<u8>) {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                let (n, from) = tokio::time::timeout(
                    Duration::from_secs(10),
                    self.socket.recv_from(&mut buf),
                )
                .await
                .expect("client frame")
                .unwrap();
                self.client = Some(from);
                let frame = frame::decode_datagram(&buf[..n]).unwrap();
                if frame.header.command != command.code() {
                    continue;
                }
                let body = tea::decrypt(frame.body, key).unwrap();
                return (frame.header.seq, body);
            }
        }

        async fn send_frame(&self, command: Command, seq: u16, body: &[u8], key: &SessionKey) {
            let cipher = tea::encrypt(body, key);
            let bytes = frame::encode_datagram(command.code(), seq, &cipher);
            self.socket
                .send_to(&bytes, self.client.expect("client address known"))
                .await
                .unwrap();
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("engine event")
            .expect("engine alive")
    }

    #[tokio::test]
    async fn login_queued_push_and_messaging() {
        let mut server = MockServer::bind().await;
        let password_key = digest::password_key(PASSWORD);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let config = EngineConfig {
            server: server.addr(),
            user_id: USER,
            password: PASSWORD.into(),
            use_tcp: false,
        };
        let engine = tokio::spawn(run_engine(config, cmd_rx, event_tx));

        // the login body carries the double-digest password key
        let (login_seq, login_body) = server.recv_command(Command::Login, &password_key).await;
        assert_eq!(login_body[..16], password_key[..]);

        // a push racing ahead of the login reply must be queued, not lost
        let im = wire::encode_im(777, USER, &ImPayload::Text("early bird".into()));
        server
            .send_frame(Command::ReceiveMessage, 4321, &im, &SESSION_KEY)
            .await;
        // tiny pause so the push is on the engine's socket first
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reply = LoginReply {
            status: command::LOGIN_OK,
            session_key: SESSION_KEY,
            public_ip: Ipv4Addr::new(203, 0, 113, 50),
            public_port: 7788,
        };
        server
            .send_frame(Command::Login, login_seq, &reply.encode(), &password_key)
            .await;

        match next_event(&mut event_rx).await {
            EngineEvent::LoggedIn {
                public_ip,
                public_port,
            } => {
                assert_eq!(public_ip, Ipv4Addr::new(203, 0, 113, 50));
                assert_eq!(public_port, 7788);
            }
            other => panic!("expected login event, got {other:?}"),
        }
        // the queued push is replayed right after login
        match next_event(&mut event_rx).await {
            EngineEvent::MessageReceived { from, text } => {
                assert_eq!(from, 777);
                assert_eq!(text, "early bird");
            }
            other => panic!("expected the queued message, got {other:?}"),
        }
        // and acknowledged under the server's sequence number
        let (ack_seq, _) = server
            .recv_command(Command::ReceiveMessage, &SESSION_KEY)
            .await;
        assert_eq!(ack_seq, 4321);

        // outbound message flows under the session key
        cmd_tx
            .send(EngineCommand::SendMessage {
                to: 555,
                text: "hello".into(),
            })
            .unwrap();
        let (msg_seq, msg_body) = server.recv_command(Command::SendMessage, &SESSION_KEY).await;
        let (envelope, payload) = wire::decode_im(&msg_body).unwrap();
        assert_eq!((envelope.sender, envelope.receiver), (USER, 555));
        assert_eq!(payload, ImPayload::Text("hello".into()));
        // ack it so the pending queue drains
        server
            .send_frame(Command::SendMessage, msg_seq, b"", &SESSION_KEY)
            .await;

        // duplicate of the early push is suppressed
        server
            .send_frame(Command::ReceiveMessage, 4321, &im, &SESSION_KEY)
            .await;

        cmd_tx.send(EngineCommand::Shutdown).unwrap();
        engine.await.unwrap().unwrap();

        // nothing but the two expected events ever surfaced
        while let Ok(event) = event_rx.try_recv() {
            panic!("unexpected trailing event: {event:?}");
        }
    }

    #[tokio::test]
    async fn refused_datagrams_do_not_kill_the_connection() {
        // bind a port, note it, close it: login datagrams now bounce
        // back as ICMP refusals on the engine's connected socket
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = dead.local_addr().unwrap();
        drop(dead);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let config = EngineConfig {
            server,
            user_id: USER,
            password: PASSWORD.into(),
            use_tcp: false,
        };
        let engine = tokio::spawn(run_engine(config, cmd_rx, event_tx));

        // the refusals must not be fatal: the login stays pending and
        // the resend scan decides when delivery has actually failed
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!engine.is_finished());

        cmd_tx.send(EngineCommand::Shutdown).unwrap();
        engine.await.unwrap().unwrap();
    }

    #[test]
    fn unanswered_login_is_fatal_with_a_typed_failure() {
        use crate::channel::DeliveryFailure;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut st = EngineState {
            user_id: USER,
            password_key: [0u8; 16],
            channel: CommandChannel::new([0u8; 16], false),
            events: event_tx,
            transfers: HashMap::new(),
            next_transfer_id: 0,
            public_ip: Ipv4Addr::UNSPECIFIED,
            public_port: 0,
            local_ip: Ipv4Addr::LOCALHOST,
        };

        let err = st
            .handle_failures(vec![DeliveryFailure {
                command: Command::Login,
                seq: 7,
                resends: 3,
            }])
            .unwrap_err();
        match err.downcast_ref::<ChannelError>() {
            Some(ChannelError::DeliveryFailed {
                command: 0x0022,
                seq: 7,
                resends: 3,
            }) => {}
            other => panic!("expected a delivery failure, got {other:?}"),
        }
        assert!(matches!(
            event_rx.try_recv().unwrap(),
            EngineEvent::ConnectionLost { .. }
        ));
    }

    #[tokio::test]
    async fn rejected_login_is_fatal() {
        let mut server = MockServer::bind().await;
        let password_key = digest::password_key(PASSWORD);

        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let config = EngineConfig {
            server: server.addr(),
            user_id: USER,
            password: PASSWORD.into(),
            use_tcp: false,
        };
        let engine = tokio::spawn(run_engine(config, cmd_rx, event_tx));

        let (login_seq, _) = server.recv_command(Command::Login, &password_key).await;
        // bad credentials status
        let mut body = vec![0x09u8];
        body.extend([0u8; 22]);
        server
            .send_frame(Command::Login, login_seq, &body, &password_key)
            .await;

        let result = tokio::time::timeout(Duration::from_secs(10), engine)
            .await
            .expect("engine exits")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn transfer_offer_is_announced_and_cancellable() {
        let mut server = MockServer::bind().await;
        let password_key = digest::password_key(PASSWORD);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let config = EngineConfig {
            server: server.addr(),
            user_id: USER,
            password: PASSWORD.into(),
            use_tcp: false,
        };
        let engine = tokio::spawn(run_engine(config, cmd_rx, event_tx));

        let (login_seq, _) = server.recv_command(Command::Login, &password_key).await;
        let reply = LoginReply {
            status: command::LOGIN_OK,
            session_key: SESSION_KEY,
            public_ip: Ipv4Addr::new(198, 51, 100, 77),
            public_port: 6000,
        };
        server
            .send_frame(Command::Login, login_seq, &reply.encode(), &password_key)
            .await;
        assert!(matches!(
            next_event(&mut event_rx).await,
            EngineEvent::LoggedIn { .. }
        ));

        // offer a real file
        let dir = std::env::temp_dir().join("lumiq_test").join("engine_offer");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("give.bin");
        std::fs::write(&path, vec![1u8; 1234]).unwrap();
        cmd_tx
            .send(EngineCommand::OfferFile {
                to: 321,
                path: path.clone(),
            })
            .unwrap();

        let (req_seq, req_body) = server.recv_command(Command::SendMessage, &SESSION_KEY).await;
        let (_, payload) = wire::decode_im(&req_body).unwrap();
        match payload {
            ImPayload::TransferRequest { size, filename, .. } => {
                assert_eq!(size, 1234);
                assert_eq!(filename, "give.bin");
            }
            other => panic!("expected a transfer request, got {other:?}"),
        }
        server
            .send_frame(Command::SendMessage, req_seq, b"", &SESSION_KEY)
            .await;

        let added = next_event(&mut event_rx).await;
        let id = match added {
            EngineEvent::TransferAdded {
                id,
                peer: 321,
                inbound: false,
                ..
            } => id,
            other => panic!("expected a transfer announcement, got {other:?}"),
        };
        assert!(matches!(
            next_event(&mut event_rx).await,
            EngineEvent::TransferStatusChanged {
                status: TransferStatus::Waiting,
                ..
            }
        ));

        // local cancel before the peer answers
        cmd_tx.send(EngineCommand::CancelTransfer { id }).unwrap();
        let (_seq, cancel_body) = server.recv_command(Command::SendMessage, &SESSION_KEY).await;
        let (_, payload) = wire::decode_im(&cancel_body).unwrap();
        assert_eq!(payload, ImPayload::TransferCancel);
        assert!(matches!(
            next_event(&mut event_rx).await,
            EngineEvent::TransferStatusChanged {
                status: TransferStatus::Canceled,
                ..
            }
        ));
        assert!(matches!(
            next_event(&mut event_rx).await,
            EngineEvent::TransferRemoved { .. }
        ));

        cmd_tx.send(EngineCommand::Shutdown).unwrap();
        engine.await.unwrap().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
