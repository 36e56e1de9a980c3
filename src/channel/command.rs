//! Command identifiers, link state and login bodies.

use crate::codec::cursor::{Reader, Writer};
use crate::crypto::SessionKey;
use crate::error::ChannelError;
use std::net::Ipv4Addr;

/// Login reply status byte meaning success.
pub const LOGIN_OK: u8 = 0x00;

/// Requested presence carried in the login body.
pub const STATUS_ONLINE: u8 = 0x0A;

/// Known command kinds. Unrecognized ids survive round trips through
/// [`Command::Other`] so they can still be acked and logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Logout,
    KeepAlive,
    ChangeStatus,
    SendMessage,
    ReceiveMessage,
    Login,
    SystemNotice,
    BuddyStatusChange,
    Other(u16),
}

impl Command {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0001 => Command::Logout,
            0x0002 => Command::KeepAlive,
            0x000D => Command::ChangeStatus,
            0x0016 => Command::SendMessage,
            0x0017 => Command::ReceiveMessage,
            0x0022 => Command::Login,
            0x0080 => Command::SystemNotice,
            0x0081 => Command::BuddyStatusChange,
            other => Command::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Command::Logout => 0x0001,
            Command::KeepAlive => 0x0002,
            Command::ChangeStatus => 0x000D,
            Command::SendMessage => 0x0016,
            Command::ReceiveMessage => 0x0017,
            Command::Login => 0x0022,
            Command::SystemNotice => 0x0080,
            Command::BuddyStatusChange => 0x0081,
            Command::Other(code) => code,
        }
    }

    /// Server-initiated pushes carry server-chosen sequence numbers and
    /// go through duplicate suppression instead of the pending queue.
    pub fn is_server_push(self) -> bool {
        matches!(
            self,
            Command::ReceiveMessage | Command::SystemNotice | Command::BuddyStatusChange
        )
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    AwaitingLoginReply,
    LoggedIn,
}

/// Decrypted login reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginReply {
    pub status: u8,
    pub session_key: SessionKey,
    pub public_ip: Ipv4Addr,
    pub public_port: u16,
}

impl LoginReply {
    pub fn decode(body: &[u8]) -> Result<Self, ChannelError> {
        let mut r = Reader::new(body);
        let status = r.get_u8().map_err(|_| ChannelError::MalformedLoginReply)?;
        if status != LOGIN_OK {
            return Err(ChannelError::LoginRejected(status));
        }
        let session_key = r.take_16().map_err(|_| ChannelError::MalformedLoginReply)?;
        let ip = r.get_u32().map_err(|_| ChannelError::MalformedLoginReply)?;
        let port = r.get_u16().map_err(|_| ChannelError::MalformedLoginReply)?;
        Ok(LoginReply {
            status,
            session_key,
            public_ip: Ipv4Addr::from(ip),
            public_port: port,
        })
    }

    #[cfg(test)]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(self.status);
        w.put_bytes(&self.session_key);
        w.put_u32(u32::from(self.public_ip));
        w.put_u16(self.public_port);
        w.into_inner()
    }
}

/// Login request body: the derived password key plus the requested
/// initial presence. Encrypted under that same password key.
pub fn login_body(password_key: &SessionKey, status: u8) -> Vec<u8> {
    let mut w = Writer::with_capacity(17);
    w.put_bytes(password_key);
    w.put_u8(status);
    w.into_inner()
}

/// Keep-alive request body: the account id in ASCII decimal.
pub fn keep_alive_body(user_id: u32) -> Vec<u8> {
    user_id.to_string().into_bytes()
}
