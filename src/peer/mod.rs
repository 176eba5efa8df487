//! Wire protocol: handshake, message framing and the per-connection state machine.

pub mod codec;
pub mod connection;
pub mod handshake;
pub mod message;
