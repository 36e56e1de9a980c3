//! UDP socket pair driver for one transfer session.
//!
//! Each transfer binds two sockets: the major socket serves the routed
//! path, the minor socket the LAN path. The driver pumps packets from
//! both into the session, runs its clock, relays engine messages
//! (endpoint updates, cancellation) and forwards session updates as
//! engine events. When the session reaches a terminal phase the task
//! returns and both sockets close with it.

use crate::config::MAX_PACKET_SIZE;
use crate::events::{EngineEvent, TransferId};
use crate::transfer::session::{PathKind, SessionOutput, TransferSession};
use crate::transfer::wire::ConnectionEndpoint;
use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Engine-to-driver control messages.
#[derive(Debug)]
pub enum DriverMsg {
    /// The peer advertised fresh endpoint data over the command channel.
    RemoteNotified(ConnectionEndpoint),
    Cancel,
}

/// The two UDP sockets one transfer owns.
pub struct SocketPair {
    pub major: UdpSocket,
    pub minor: UdpSocket,
}

impl SocketPair {
    pub async fn bind() -> std::io::Result<Self> {
        Ok(Self {
            major: UdpSocket::bind("0.0.0.0:0").await?,
            minor: UdpSocket::bind("0.0.0.0:0").await?,
        })
    }

    pub fn major_port(&self) -> std::io::Result<u16> {
        Ok(self.major.local_addr()?.port())
    }

    pub fn minor_port(&self) -> std::io::Result<u16> {
        Ok(self.minor.local_addr()?.port())
    }
}

pub struct TransferDriver {
    id: TransferId,
    session: TransferSession,
    sockets: SocketPair,
    msgs: mpsc::UnboundedReceiver<DriverMsg>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl TransferDriver {
    pub fn new(
        id: TransferId,
        session: TransferSession,
        sockets: SocketPair,
        msgs: mpsc::UnboundedReceiver<DriverMsg>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            id,
            session,
            sockets,
            msgs,
            events,
        }
    }

    /// Pump the session until it reaches a terminal phase.
    pub async fn run(mut self) -> Result<()> {
        let outputs = self.session.start(Instant::now());
        self.apply(outputs).await;

        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut major_buf = vec![0u8; MAX_PACKET_SIZE];
        let mut minor_buf = vec![0u8; MAX_PACKET_SIZE];

        while !self.session.phase().is_terminal() {
            let outputs = tokio::select! {
                received = self.sockets.major.recv_from(&mut major_buf) => {
                    let (n, from) = received.context("major socket receive")?;
                    debug!(id = self.id, bytes = n, %from, "packet on major socket");
                    let raw = major_buf[..n].to_vec();
                    self.intake(&raw)
                }
                received = self.sockets.minor.recv_from(&mut minor_buf) => {
                    let (n, from) = received.context("minor socket receive")?;
                    debug!(id = self.id, bytes = n, %from, "packet on minor socket");
                    let raw = minor_buf[..n].to_vec();
                    self.intake(&raw)
                }
                _ = ticker.tick() => self.session.tick(Instant::now()),
                msg = self.msgs.recv() => match msg {
                    Some(DriverMsg::RemoteNotified(endpoint)) => {
                        self.session.on_remote_notified(endpoint)
                    }
                    Some(DriverMsg::Cancel) | None => self.session.cancel(),
                },
            };
            self.apply(outputs).await;
        }

        info!(id = self.id, phase = ?self.session.phase(), "transfer driver finished");
        let _ = self.events.send(EngineEvent::TransferRemoved { id: self.id });
        Ok(())
    }

    fn intake(&mut self, raw: &[u8]) -> Vec<SessionOutput> {
        match self.session.on_packet(raw, Instant::now()) {
            Ok(outputs) => outputs,
            Err(err) => {
                warn!(id = self.id, %err, "undecodable transfer packet dropped");
                Vec::new()
            }
        }
    }

    async fn apply(&mut self, outputs: Vec<SessionOutput>) {
        for output in outputs {
            match output {
                SessionOutput::Packet(bytes) => {
                    let dest = self.session.remote_addr();
                    let socket = match self.session.path() {
                        PathKind::Direct => &self.sockets.major,
                        PathKind::Lan => &self.sockets.minor,
                    };
                    if let Err(err) = socket.send_to(&bytes, dest).await {
                        warn!(id = self.id, %dest, %err, "transfer packet send failed");
                    }
                }
                SessionOutput::Progress { bytes, total } => {
                    let _ = self.events.send(EngineEvent::TransferProgress {
                        id: self.id,
                        bytes,
                        total,
                    });
                }
                SessionOutput::Status(status) => {
                    let _ = self.events.send(EngineEvent::TransferStatusChanged {
                        id: self.id,
                        status,
                    });
                }
                SessionOutput::PathSwitched(path) => {
                    debug!(id = self.id, ?path, "transfer path switched");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKey;
    use crate::events::TransferStatus;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    const KEY: SessionKey = [0x77; 16];

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("lumiq_test")
            .join("driver")
            .join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn loopback_endpoint(major: u16, minor: u16) -> ConnectionEndpoint {
        let lo = Ipv4Addr::LOCALHOST;
        ConnectionEndpoint {
            method: 0,
            public_ip: lo,
            public_port: major,
            major_port: major,
            local_ip: lo,
            minor_port: minor,
        }
    }

    #[tokio::test]
    async fn loopback_transfer_end_to_end() {
        let dir = test_dir("loopback");
        let src = dir.join("src.bin");
        let dst = dir.join("dst.bin");
        let data: Vec<u8> = (0..12_345u32).map(|i| (i % 233) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let sender_sockets = SocketPair::bind().await.unwrap();
        let receiver_sockets = SocketPair::bind().await.unwrap();
        let sender_ep = loopback_endpoint(
            sender_sockets.major_port().unwrap(),
            sender_sockets.minor_port().unwrap(),
        );
        let receiver_ep = loopback_endpoint(
            receiver_sockets.major_port().unwrap(),
            receiver_sockets.minor_port().unwrap(),
        );

        let now = Instant::now();
        let sender_session = TransferSession::sender(
            1, 2, KEY, sender_ep, receiver_ep, &src, "src.bin".into(), now,
        )
        .unwrap();
        let receiver_session =
            TransferSession::receiver(2, 1, KEY, receiver_ep, sender_ep, dst.clone(), now);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_s_msg_tx, s_msg_rx) = mpsc::unbounded_channel();
        let (_r_msg_tx, r_msg_rx) = mpsc::unbounded_channel();

        let sender_driver =
            TransferDriver::new(1, sender_session, sender_sockets, s_msg_rx, events_tx.clone());
        let receiver_driver =
            TransferDriver::new(2, receiver_session, receiver_sockets, r_msg_rx, events_tx);

        let s = tokio::spawn(sender_driver.run());
        let r = tokio::spawn(receiver_driver.run());

        let mut finished = 0;
        let mut removed = 0;
        let deadline = tokio::time::sleep(Duration::from_secs(30));
        tokio::pin!(deadline);
        while removed < 2 {
            tokio::select! {
                event = events_rx.recv() => match event.unwrap() {
                    EngineEvent::TransferStatusChanged {
                        status: TransferStatus::Finished,
                        ..
                    } => finished += 1,
                    EngineEvent::TransferRemoved { .. } => removed += 1,
                    _ => {}
                },
                _ = &mut deadline => panic!("transfer did not finish in time"),
            }
        }
        assert_eq!(finished, 2);
        s.await.unwrap().unwrap();
        r.await.unwrap().unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), data);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn cancel_message_stops_the_driver() {
        let dir = test_dir("cancel");
        let src = dir.join("src.bin");
        std::fs::write(&src, vec![5u8; 4000]).unwrap();

        let sockets = SocketPair::bind().await.unwrap();
        let ep = loopback_endpoint(sockets.major_port().unwrap(), sockets.minor_port().unwrap());
        // the peer never answers; cancellation must still end the task
        let dead_peer = loopback_endpoint(1, 1);

        let session = TransferSession::sender(
            1,
            2,
            KEY,
            ep,
            dead_peer,
            &src,
            "src.bin".into(),
            Instant::now(),
        )
        .unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let driver = TransferDriver::new(9, session, sockets, msg_rx, events_tx);
        let handle = tokio::spawn(driver.run());

        msg_tx.send(DriverMsg::Cancel).unwrap();

        let mut saw_cancel = false;
        let mut saw_removed = false;
        let deadline = tokio::time::sleep(Duration::from_secs(10));
        tokio::pin!(deadline);
        while !saw_removed {
            tokio::select! {
                event = events_rx.recv() => match event.unwrap() {
                    EngineEvent::TransferStatusChanged {
                        id: 9,
                        status: TransferStatus::Canceled,
                    } => saw_cancel = true,
                    EngineEvent::TransferRemoved { id: 9 } => saw_removed = true,
                    _ => {}
                },
                _ = &mut deadline => panic!("cancel did not stop the driver"),
            }
        }
        assert!(saw_cancel);
        handle.await.unwrap().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
