//! Keepalive subprocess RPC — long-lived backends behind a line-delimited
//! JSON protocol.

pub mod client;
pub mod protocol;

pub use client::{KeepaliveClient, KeepaliveConfig, KeepaliveState, KeepaliveStatus};
pub use protocol::{ResultFrame, ServerMessage};
