//! Peer-to-peer UDP file transfer.
//!
//! A transfer is negotiated over the command channel (request, accept,
//! endpoint notification) and then runs on a direct UDP exchange
//! between the peers:
//!
//! 1. a ping/hello handshake proves the chosen path works;
//! 2. a metadata packet describes the file (length, fragment geometry,
//!    digests, name);
//! 3. fragments flow under a fixed-width selective-ack sliding window;
//! 4. an end-of-file exchange closes the session.
//!
//! [`session::TransferSession`] holds all protocol state and is pure;
//! [`driver::TransferDriver`] binds the socket pair and pumps it.

pub mod driver;
pub mod session;
pub mod store;
pub mod window;
pub mod wire;

pub use session::{TransferRole, TransferSession};
pub use wire::ConnectionEndpoint;
