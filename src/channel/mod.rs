//! The reliable command channel.
//!
//! [`CommandChannel`] is a pure state machine over the encrypted frame
//! layer: it owns the sequence counter, the pending-ack queue, the
//! full-range duplicate window and the pre-login frame queue. It never
//! touches a socket; the engine feeds it received frames and clock
//! ticks and transmits whatever it hands back.

pub mod channel;
pub mod command;
pub mod dedup;
pub mod pending;

pub use channel::{ChannelEvent, CommandChannel, OutboundFrame, TickOutcome};
pub use command::{Command, LinkState, LoginReply};
pub use dedup::DuplicateWindow;
pub use pending::{DeliveryFailure, PendingCommand, PendingQueue};
