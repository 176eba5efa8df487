//! Incremental frame decoder over an accumulating byte buffer, grounded in
//! `bip_peer::codec::PeerProtocolCodec`'s `bytes_needed`/`split_to`/max-payload shape, adapted
//! from `tokio_io::codec::Decoder` (async, not in this crate's dependency set) to a plain
//! `decode(&mut BytesMut) -> Option<Message>` call driven by the cooperative event loop.

use bytes::{Buf, BytesMut};
use byteorder::{BigEndian, ByteOrder};

use crate::config::MAX_MESSAGE_LEN;
use crate::error::{ConnectionErrorKind, ConnectionResult};
use crate::peer::message::{Message, ParseError};

#[derive(Debug)]
pub struct MessageDecoder {
    max_payload: u32,
}

impl MessageDecoder {
    pub fn new() -> MessageDecoder {
        MessageDecoder { max_payload: MAX_MESSAGE_LEN }
    }

    pub fn with_max_payload(max_payload: u32) -> MessageDecoder {
        MessageDecoder { max_payload }
    }

    /// Decode at most one message out of `src`, consuming its bytes on success. Returns `None`
    /// if the buffer does not yet hold a complete frame.
    pub fn decode(&mut self, src: &mut BytesMut) -> ConnectionResult<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = BigEndian::read_u32(&src[0..4]);
        if length > self.max_payload {
            return Err(ConnectionErrorKind::CommunicationError { reason: format!("message length {} exceeds maximum", length) }.into());
        }
        if length == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        let frame_len = 4 + length as usize;
        if src.len() < frame_len {
            return Ok(None);
        }

        let id = src[4];
        let body = src[5..frame_len].to_vec();
        src.advance(frame_len);

        Message::parse(id, &body).map(Some).map_err(|e| match e {
            ParseError::UnknownId(id) => ConnectionErrorKind::CommunicationError { reason: format!("unknown message id {}", id) }.into(),
            ParseError::BadRequestLength(len) => ConnectionErrorKind::CommunicationError { reason: format!("bad request length {}", len) }.into(),
            ParseError::Truncated => ConnectionErrorKind::CommunicationError { reason: "message body truncated".to_string() }.into(),
        })
    }
}

impl Default for MessageDecoder {
    fn default() -> MessageDecoder {
        MessageDecoder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_waits_for_full_frame() {
        let mut decoder = MessageDecoder::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 5, 4][..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[0, 0, 0, 7]);
        let message = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message, Message::Have { index: 7 });
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_keep_alive() {
        let mut decoder = MessageDecoder::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
    }

    #[test]
    fn decode_rejects_oversized_length() {
        let mut decoder = MessageDecoder::with_max_payload(10);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 20][..]);
        assert!(decoder.decode(&mut buf).is_err());
    }
}
