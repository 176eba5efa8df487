//! Per-peer message state machine, modeled as an explicit state struct
//! driven by `feed(bytes, now_us) -> Vec<ConnectionEvent>` rather than real async I/O -- no
//! `async`/`await` is required; a poller drives handlers to completion on readiness.
//! Grounded in the `ready`/`timeout`/`wakeup` shape of
//! `bip_peer::protocol::machine::AcceptPeer`, translated out of the `rotor` state-machine
//! framework (not in this crate's dependency set) into plain method calls.

use bytes::BytesMut;

use crate::config::KEEP_ALIVE_TIMEOUT_SECS;
use crate::error::{ConnectionErrorKind, ConnectionResult};
use crate::peer::codec::MessageDecoder;
use crate::peer::message::Message;

#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Choked,
    Unchoked,
    Interested,
    NotInterested,
    Have { index: u32 },
    BitfieldReceived { bytes: Vec<u8> },
    Requested { index: u32, offset: u32, length: u32 },
    PieceReceived { index: u32, offset: u32, bytes: Vec<u8> },
    Canceled { index: u32, offset: u32, length: u32 },
    PortReceived { port: u16 },
    ExtensionReceived { ext_id: u8, payload: Vec<u8> },
    KeepAlive,
}

#[derive(Debug)]
pub struct ConnectionState {
    decoder: MessageDecoder,
    incoming: BytesMut,
    chunk_total: u32,
    peer_choking: bool,
    peer_interested: bool,
    am_interested: bool,
    last_received_us: u64,
}

impl ConnectionState {
    pub fn new(chunk_total: u32, now_us: u64) -> ConnectionState {
        ConnectionState {
            decoder: MessageDecoder::new(),
            incoming: BytesMut::new(),
            chunk_total,
            peer_choking: true,
            peer_interested: false,
            am_interested: false,
            last_received_us: now_us,
        }
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn set_am_interested(&mut self, value: bool) {
        self.am_interested = value;
    }

    /// Feed freshly-read bytes in, draining every complete message currently buffered.
    /// `CHOKE`/`UNCHOKE`/interest bookkeeping happens here; download-queue and choke-queue
    /// side effects are the caller's responsibility, driven off the returned events.
    pub fn feed(&mut self, bytes: &[u8], now_us: u64) -> ConnectionResult<Vec<ConnectionEvent>> {
        self.last_received_us = now_us;
        self.incoming.extend_from_slice(bytes);

        let mut events = Vec::new();
        loop {
            match self.decoder.decode(&mut self.incoming)? {
                None => break,
                Some(Message::KeepAlive) => events.push(ConnectionEvent::KeepAlive),
                Some(message) => events.push(self.apply(message)?),
            }
        }
        Ok(events)
    }

    fn apply(&mut self, message: Message) -> ConnectionResult<ConnectionEvent> {
        match message {
            Message::Choke => {
                self.peer_choking = true;
                Ok(ConnectionEvent::Choked)
            }
            Message::Unchoke => {
                self.peer_choking = false;
                Ok(ConnectionEvent::Unchoked)
            }
            Message::Interested => {
                self.peer_interested = true;
                Ok(ConnectionEvent::Interested)
            }
            Message::NotInterested => {
                self.peer_interested = false;
                Ok(ConnectionEvent::NotInterested)
            }
            Message::Have { index } => {
                if index >= self.chunk_total {
                    return Err(ConnectionErrorKind::CommunicationError { reason: format!("HAVE index {} out of range (total {})", index, self.chunk_total) }.into());
                }
                Ok(ConnectionEvent::Have { index })
            }
            Message::Bitfield { bytes } => Ok(ConnectionEvent::BitfieldReceived { bytes }),
            Message::Request { index, offset, length } => Ok(ConnectionEvent::Requested { index, offset, length }),
            Message::Piece { index, offset, bytes } => Ok(ConnectionEvent::PieceReceived { index, offset, bytes }),
            Message::Cancel { index, offset, length } => Ok(ConnectionEvent::Canceled { index, offset, length }),
            Message::Port { port } => Ok(ConnectionEvent::PortReceived { port }),
            Message::Extension { ext_id, payload } => Ok(ConnectionEvent::ExtensionReceived { ext_id, payload }),
            Message::KeepAlive => unreachable!("handled by the caller before apply is reached"),
        }
    }

    /// True once `now_us` is more than `KEEP_ALIVE_TIMEOUT_SECS` past the last received byte.
    pub fn is_silent(&self, now_us: u64) -> bool {
        let elapsed_us = now_us.saturating_sub(self.last_received_us);
        elapsed_us > KEEP_ALIVE_TIMEOUT_SECS * 1_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }

    #[test]
    fn choke_then_unchoke_updates_state() {
        let mut conn = ConnectionState::new(10, 0);
        let events = conn.feed(&frame(&[0, 0, 0, 1, 0]), 1).unwrap();
        assert_eq!(events, vec![ConnectionEvent::Choked]);
        assert!(conn.peer_choking());

        let events = conn.feed(&frame(&[0, 0, 0, 1, 1]), 2).unwrap();
        assert_eq!(events, vec![ConnectionEvent::Unchoked]);
        assert!(!conn.peer_choking());
    }

    #[test]
    fn have_out_of_range_is_fatal() {
        let mut conn = ConnectionState::new(4, 0);
        let mut bytes = vec![0, 0, 0, 5, 4];
        bytes.extend_from_slice(&100u32.to_be_bytes());
        assert!(conn.feed(&bytes, 1).is_err());
    }

    #[test]
    fn silence_past_keep_alive_timeout_is_detected() {
        let conn = ConnectionState::new(4, 0);
        assert!(!conn.is_silent(100));
        assert!(conn.is_silent(KEEP_ALIVE_TIMEOUT_SECS * 1_000_000 + 1));
    }

    #[test]
    fn two_messages_in_one_feed_both_drain() {
        let mut conn = ConnectionState::new(4, 0);
        let mut bytes = frame(&[0, 0, 0, 1, 2]);
        bytes.extend_from_slice(&[0, 0, 0, 1, 1]);
        let events = conn.feed(&bytes, 1).unwrap();
        assert_eq!(events, vec![ConnectionEvent::Interested, ConnectionEvent::Unchoked]);
    }
}
