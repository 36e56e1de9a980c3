//! File-transfer packet formats.
//!
//! Three layers live here:
//!
//! - the UDP outer envelope with masked peer ids;
//! - control packets (handshake, liveness) whose bodies travel
//!   encrypted under the per-transfer key;
//! - data packets (metadata, fragments, end-of-file) that travel in
//!   clear after the envelope;
//!
//! plus the IM payloads that negotiate a transfer over the command
//! channel before any UDP packet flows.

use crate::codec::cursor::{Reader, Writer};
use crate::config::SOURCE_TAG;
use crate::crypto::SessionKey;
use crate::error::CodecError;
use std::net::Ipv4Addr;

// ── Outer envelope ─────────────────────────────────────────────────────────────

/// Envelope tag for an encrypted control packet.
pub const TAG_CONTROL: u8 = 0x00;

/// Envelope tag for a clear data packet.
pub const TAG_DATA: u8 = 0x01;

/// Byte that selects a file transfer (as opposed to other peer-to-peer
/// exchanges) in control packets and IM payloads.
pub const KIND_FILE: u8 = 0x65;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketEnvelope {
    pub tag: u8,
    pub sender: u32,
    pub receiver: u32,
}

fn mask_key(seed: u8) -> u32 {
    u32::from_be_bytes([seed; 4])
}

fn mask_id(id: u32, key: u32) -> u32 {
    (!id) ^ key
}

fn unmask_id(masked: u32, key: u32) -> u32 {
    !(masked ^ key)
}

/// Wrap `inner` (an encrypted control body or a clear data body) in
/// the outer envelope. Peer ids are masked with a fresh random seed.
pub fn encode_file_packet(tag: u8, sender: u32, receiver: u32, inner: &[u8]) -> Vec<u8> {
    let seed: u8 = rand::random();
    let key = mask_key(seed);
    let mut w = Writer::with_capacity(12 + inner.len());
    w.put_u8(tag);
    w.put_u16(SOURCE_TAG);
    w.put_u8(seed);
    w.put_u32(mask_id(sender, key));
    w.put_u32(mask_id(receiver, key));
    w.put_bytes(inner);
    w.into_inner()
}

/// Split a received packet into its envelope and inner body.
pub fn decode_file_packet(raw: &[u8]) -> Result<(PacketEnvelope, &[u8]), CodecError> {
    let mut r = Reader::new(raw);
    let tag = r.get_u8()?;
    let _client_tag = r.get_u16()?;
    let seed = r.get_u8()?;
    let key = mask_key(seed);
    let sender = unmask_id(r.get_u32()?, key);
    let receiver = unmask_id(r.get_u32()?, key);
    Ok((
        PacketEnvelope {
            tag,
            sender,
            receiver,
        },
        r.rest(),
    ))
}

// ── Connection endpoint ────────────────────────────────────────────────────────

/// The 15-byte endpoint descriptor a peer advertises: its server-seen
/// public address, its two local UDP ports and its LAN address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEndpoint {
    pub method: u8,
    pub public_ip: Ipv4Addr,
    pub public_port: u16,
    pub major_port: u16,
    pub local_ip: Ipv4Addr,
    pub minor_port: u16,
}

impl ConnectionEndpoint {
    pub const WIRE_LEN: usize = 15;

    pub fn encode_into(&self, w: &mut Writer) {
        w.put_u8(self.method);
        w.put_u32(u32::from(self.public_ip));
        w.put_u16(self.public_port);
        w.put_u16(self.major_port);
        w.put_u32(u32::from(self.local_ip));
        w.put_u16(self.minor_port);
    }

    pub fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            method: r.get_u8()?,
            public_ip: Ipv4Addr::from(r.get_u32()?),
            public_port: r.get_u16()?,
            major_port: r.get_u16()?,
            local_ip: Ipv4Addr::from(r.get_u32()?),
            minor_port: r.get_u16()?,
        })
    }

    /// Both peers behind the same public address: prefer the LAN path.
    pub fn same_lan_as(&self, local_public: Ipv4Addr) -> bool {
        self.public_ip == local_public
    }
}

// ── Control packets ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    SenderHello,
    SenderHelloAck,
    ReceiverHello,
    ReceiverHelloAck,
    NotifyAck,
    Ping,
    Pong,
}

impl ControlKind {
    pub fn from_code(code: u16) -> Result<Self, CodecError> {
        Ok(match code {
            0x0001 => ControlKind::SenderHello,
            0x0002 => ControlKind::SenderHelloAck,
            0x0003 => ControlKind::ReceiverHello,
            0x0004 => ControlKind::ReceiverHelloAck,
            0x0005 => ControlKind::NotifyAck,
            0x0006 => ControlKind::Ping,
            0x0007 => ControlKind::Pong,
            other => return Err(CodecError::UnknownKind(other)),
        })
    }

    pub fn code(self) -> u16 {
        match self {
            ControlKind::SenderHello => 0x0001,
            ControlKind::SenderHelloAck => 0x0002,
            ControlKind::ReceiverHello => 0x0003,
            ControlKind::ReceiverHelloAck => 0x0004,
            ControlKind::NotifyAck => 0x0005,
            ControlKind::Ping => 0x0006,
            ControlKind::Pong => 0x0007,
        }
    }

    /// Hello-family packets carry a one-byte nonce; the rest carry the
    /// sender's endpoint descriptor.
    pub fn carries_nonce(self) -> bool {
        matches!(
            self,
            ControlKind::SenderHello
                | ControlKind::SenderHelloAck
                | ControlKind::ReceiverHello
                | ControlKind::ReceiverHelloAck
        )
    }
}

/// A decoded control packet body (after decryption).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPacket {
    /// The transfer key echoed in the header; authenticates the packet
    /// against the negotiated key.
    pub key: SessionKey,
    pub kind: ControlKind,
    pub seq: u16,
    pub nonce: u8,
    pub endpoint: Option<ConnectionEndpoint>,
}

/// Build a control packet plaintext. `payload` semantics follow
/// [`ControlKind::carries_nonce`].
pub fn encode_control(
    key: &SessionKey,
    kind: ControlKind,
    seq: u16,
    icon: u8,
    nonce: u8,
    endpoint: Option<&ConnectionEndpoint>,
) -> Vec<u8> {
    let mut w = Writer::with_capacity(40 + ConnectionEndpoint::WIRE_LEN);
    w.put_bytes(key);
    w.put_u16(kind.code());
    w.put_u16(seq);
    w.put_u8(0);
    w.put_u8(icon);
    w.put_zeros(12);
    w.put_zeros(2);
    w.put_zeros(1);
    w.put_u8(KIND_FILE);
    if kind.carries_nonce() {
        w.put_u8(0);
        w.put_u8(nonce);
    } else if let Some(ep) = endpoint {
        ep.encode_into(&mut w);
    }
    w.into_inner()
}

/// Parse a decrypted control body.
pub fn decode_control(plain: &[u8]) -> Result<ControlPacket, CodecError> {
    let mut r = Reader::new(plain);
    let key = r.take_16()?;
    let kind = ControlKind::from_code(r.get_u16()?)?;
    let seq = r.get_u16()?;
    r.skip(2)?; // reserved + icon
    r.skip(15)?; // reserved run
    let selector = r.get_u8()?;
    if selector != KIND_FILE {
        return Err(CodecError::UnknownKind(selector as u16));
    }
    let mut nonce = 0;
    let mut endpoint = None;
    if kind.carries_nonce() {
        r.skip(1)?;
        nonce = r.get_u8()?;
    } else if r.remaining() >= ConnectionEndpoint::WIRE_LEN {
        endpoint = Some(ConnectionEndpoint::decode_from(&mut r)?);
    }
    Ok(ControlPacket {
        key,
        kind,
        seq,
        nonce,
        endpoint,
    })
}

// ── Data packets ───────────────────────────────────────────────────────────────

const OP_FILE: u16 = 0x0008;
const OP_FILE_ACK: u16 = 0x0009;

const SUB_BASIC_INFO: u8 = 0x01;
const SUB_DATA_INFO: u8 = 0x02;
const SUB_EOF: u8 = 0x03;

/// Clear-body packets that move metadata and fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataPacket {
    BasicInfo {
        file_len: u32,
        fragment_count: u32,
        fragment_len: u32,
        file_digest: [u8; 16],
        name_digest: [u8; 16],
        filename: String,
    },
    BasicInfoAck,
    DataInfo {
        seq: u16,
        index: u32,
        offset: u32,
        payload: Vec<u8>,
    },
    DataInfoAck {
        seq: u16,
        index: u32,
    },
    Eof {
        seq: u16,
    },
    EofAck {
        seq: u16,
    },
}

pub fn encode_data_packet(packet: &DataPacket) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(0);
    match packet {
        DataPacket::BasicInfo {
            file_len,
            fragment_count,
            fragment_len,
            file_digest,
            name_digest,
            filename,
        } => {
            w.put_u16(OP_FILE);
            w.put_u16(0);
            w.put_u8(SUB_BASIC_INFO);
            w.put_u32(*file_len);
            w.put_u32(*fragment_count);
            w.put_u32(*fragment_len);
            w.put_bytes(file_digest);
            w.put_bytes(name_digest);
            w.put_u16(filename.len() as u16);
            w.put_zeros(8);
            w.put_bytes(filename.as_bytes());
        }
        DataPacket::BasicInfoAck => {
            w.put_u16(OP_FILE_ACK);
            w.put_u16(0);
            w.put_u8(SUB_BASIC_INFO);
            w.put_u32(0);
        }
        DataPacket::DataInfo {
            seq,
            index,
            offset,
            payload,
        } => {
            w.put_u16(OP_FILE);
            w.put_u16(*seq);
            w.put_u8(SUB_DATA_INFO);
            w.put_u32(*index);
            w.put_u32(*offset);
            w.put_u16(payload.len() as u16);
            w.put_bytes(payload);
        }
        DataPacket::DataInfoAck { seq, index } => {
            w.put_u16(OP_FILE_ACK);
            w.put_u16(*seq);
            w.put_u8(SUB_DATA_INFO);
            w.put_u32(*index);
        }
        DataPacket::Eof { seq } => {
            w.put_u16(OP_FILE);
            w.put_u16(*seq);
            w.put_u8(SUB_EOF);
        }
        DataPacket::EofAck { seq } => {
            w.put_u16(OP_FILE_ACK);
            w.put_u16(*seq);
            w.put_u8(SUB_EOF);
        }
    }
    w.into_inner()
}

pub fn decode_data_packet(body: &[u8]) -> Result<DataPacket, CodecError> {
    let mut r = Reader::new(body);
    r.skip(1)?; // reserved
    let op = r.get_u16()?;
    let seq = r.get_u16()?;
    let sub = r.get_u8()?;
    match (op, sub) {
        (OP_FILE, SUB_BASIC_INFO) => {
            let file_len = r.get_u32()?;
            let fragment_count = r.get_u32()?;
            let fragment_len = r.get_u32()?;
            let file_digest = r.take_16()?;
            let name_digest = r.take_16()?;
            let name_len = r.get_u16()? as usize;
            r.skip(8)?;
            let filename = String::from_utf8_lossy(r.take(name_len)?).into_owned();
            Ok(DataPacket::BasicInfo {
                file_len,
                fragment_count,
                fragment_len,
                file_digest,
                name_digest,
                filename,
            })
        }
        (OP_FILE_ACK, SUB_BASIC_INFO) => Ok(DataPacket::BasicInfoAck),
        (OP_FILE, SUB_DATA_INFO) => {
            let index = r.get_u32()?;
            let offset = r.get_u32()?;
            let len = r.get_u16()? as usize;
            let payload = r.take(len)?.to_vec();
            Ok(DataPacket::DataInfo {
                seq,
                index,
                offset,
                payload,
            })
        }
        (OP_FILE_ACK, SUB_DATA_INFO) => Ok(DataPacket::DataInfoAck {
            seq,
            index: r.get_u32()?,
        }),
        (OP_FILE, SUB_EOF) => Ok(DataPacket::Eof { seq }),
        (OP_FILE_ACK, SUB_EOF) => Ok(DataPacket::EofAck { seq }),
        (op, _) => Err(CodecError::UnknownKind(op)),
    }
}

// ── IM payloads ────────────────────────────────────────────────────────────────

const IM_TEXT: u16 = 0x0001;
const IM_XFER_REQUEST: u16 = 0x0035;
const IM_XFER_ACCEPT: u16 = 0x0037;
const IM_XFER_REJECT: u16 = 0x0039;
const IM_XFER_NOTIFY: u16 = 0x003B;
const IM_XFER_CANCEL: u16 = 0x0049;

/// Addressing prefix shared by every IM body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImEnvelope {
    pub sender: u32,
    pub receiver: u32,
}

/// The decrypted content of a send-IM / recv-IM body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImPayload {
    Text(String),
    /// Offer a file; the advertised endpoint may carry zero ports, the
    /// real ones follow in `TransferNotify` once sockets are bound.
    TransferRequest {
        endpoint: ConnectionEndpoint,
        size: u32,
        filename: String,
    },
    TransferAccept {
        key: SessionKey,
        endpoint: ConnectionEndpoint,
    },
    TransferReject,
    TransferNotify {
        endpoint: ConnectionEndpoint,
    },
    TransferCancel,
}

pub fn encode_im(sender: u32, receiver: u32, payload: &ImPayload) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u32(sender);
    w.put_u32(receiver);
    match payload {
        ImPayload::Text(text) => {
            w.put_u16(IM_TEXT);
            w.put_bytes(text.as_bytes());
        }
        ImPayload::TransferRequest {
            endpoint,
            size,
            filename,
        } => {
            w.put_u16(IM_XFER_REQUEST);
            w.put_u8(KIND_FILE);
            endpoint.encode_into(&mut w);
            w.put_u32(*size);
            w.put_u16(filename.len() as u16);
            w.put_bytes(filename.as_bytes());
        }
        ImPayload::TransferAccept { key, endpoint } => {
            w.put_u16(IM_XFER_ACCEPT);
            w.put_u8(KIND_FILE);
            w.put_bytes(key);
            endpoint.encode_into(&mut w);
        }
        ImPayload::TransferReject => {
            w.put_u16(IM_XFER_REJECT);
            w.put_u8(KIND_FILE);
        }
        ImPayload::TransferNotify { endpoint } => {
            w.put_u16(IM_XFER_NOTIFY);
            w.put_u8(KIND_FILE);
            endpoint.encode_into(&mut w);
        }
        ImPayload::TransferCancel => {
            w.put_u16(IM_XFER_CANCEL);
            w.put_u8(KIND_FILE);
        }
    }
    w.into_inner()
}

pub fn decode_im(body: &[u8]) -> Result<(ImEnvelope, ImPayload), CodecError> {
    let mut r = Reader::new(body);
    let envelope = ImEnvelope {
        sender: r.get_u32()?,
        receiver: r.get_u32()?,
    };
    let kind = r.get_u16()?;
    let payload = match kind {
        IM_TEXT => ImPayload::Text(String::from_utf8_lossy(r.rest()).into_owned()),
        IM_XFER_REQUEST => {
            r.skip(1)?;
            let endpoint = ConnectionEndpoint::decode_from(&mut r)?;
            let size = r.get_u32()?;
            let name_len = r.get_u16()? as usize;
            let filename = String::from_utf8_lossy(r.take(name_len)?).into_owned();
            ImPayload::TransferRequest {
                endpoint,
                size,
                filename,
            }
        }
        IM_XFER_ACCEPT => {
            r.skip(1)?;
            ImPayload::TransferAccept {
                key: r.take_16()?,
                endpoint: ConnectionEndpoint::decode_from(&mut r)?,
            }
        }
        IM_XFER_REJECT => ImPayload::TransferReject,
        IM_XFER_NOTIFY => {
            r.skip(1)?;
            ImPayload::TransferNotify {
                endpoint: ConnectionEndpoint::decode_from(&mut r)?,
            }
        }
        IM_XFER_CANCEL => ImPayload::TransferCancel,
        other => return Err(CodecError::UnknownKind(other)),
    };
    Ok((envelope, payload))
}
