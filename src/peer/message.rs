//! Wire message enum, parsing and serializing. Grounded in
//! `bip_peer::message::standard` and `bip_peer::message::mod.rs`'s length/id constant tables, but
//! using `byteorder` directly for parsing rather than `nom` since no parser-combinator dependency
//! survives the trim here.

use std::io::{self, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::config::MAX_PIECE_LENGTH;

pub const CHOKE_ID: u8 = 0;
pub const UNCHOKE_ID: u8 = 1;
pub const INTERESTED_ID: u8 = 2;
pub const NOT_INTERESTED_ID: u8 = 3;
pub const HAVE_ID: u8 = 4;
pub const BITFIELD_ID: u8 = 5;
pub const REQUEST_ID: u8 = 6;
pub const PIECE_ID: u8 = 7;
pub const CANCEL_ID: u8 = 8;
pub const PORT_ID: u8 = 9;
pub const EXTENSION_ID: u8 = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { bytes: Vec<u8> },
    Request { index: u32, offset: u32, length: u32 },
    Piece { index: u32, offset: u32, bytes: Vec<u8> },
    Cancel { index: u32, offset: u32, length: u32 },
    Port { port: u16 },
    Extension { ext_id: u8, payload: Vec<u8> },
}

#[derive(Debug)]
pub enum ParseError {
    UnknownId(u8),
    BadRequestLength(u32),
    Truncated,
}

impl Message {
    /// Parse one message body (not including the `u32` length prefix) given its declared
    /// `length` and leading id byte already consumed by the caller.
    pub fn parse(id: u8, mut body: &[u8]) -> Result<Message, ParseError> {
        match id {
            CHOKE_ID => Ok(Message::Choke),
            UNCHOKE_ID => Ok(Message::Unchoke),
            INTERESTED_ID => Ok(Message::Interested),
            NOT_INTERESTED_ID => Ok(Message::NotInterested),
            HAVE_ID => {
                let index = body.read_u32::<BigEndian>().map_err(|_| ParseError::Truncated)?;
                Ok(Message::Have { index })
            }
            BITFIELD_ID => Ok(Message::Bitfield { bytes: body.to_vec() }),
            REQUEST_ID => {
                let index = body.read_u32::<BigEndian>().map_err(|_| ParseError::Truncated)?;
                let offset = body.read_u32::<BigEndian>().map_err(|_| ParseError::Truncated)?;
                let length = body.read_u32::<BigEndian>().map_err(|_| ParseError::Truncated)?;
                if length == 0 || length > MAX_PIECE_LENGTH {
                    return Err(ParseError::BadRequestLength(length));
                }
                Ok(Message::Request { index, offset, length })
            }
            PIECE_ID => {
                let index = body.read_u32::<BigEndian>().map_err(|_| ParseError::Truncated)?;
                let offset = body.read_u32::<BigEndian>().map_err(|_| ParseError::Truncated)?;
                Ok(Message::Piece { index, offset, bytes: body.to_vec() })
            }
            CANCEL_ID => {
                let index = body.read_u32::<BigEndian>().map_err(|_| ParseError::Truncated)?;
                let offset = body.read_u32::<BigEndian>().map_err(|_| ParseError::Truncated)?;
                let length = body.read_u32::<BigEndian>().map_err(|_| ParseError::Truncated)?;
                Ok(Message::Cancel { index, offset, length })
            }
            PORT_ID => {
                let port = body.read_u16::<BigEndian>().map_err(|_| ParseError::Truncated)?;
                Ok(Message::Port { port })
            }
            EXTENSION_ID => {
                if body.is_empty() {
                    return Err(ParseError::Truncated);
                }
                Ok(Message::Extension { ext_id: body[0], payload: body[1..].to_vec() })
            }
            other => Err(ParseError::UnknownId(other)),
        }
    }

    /// Write the full `length_prefix + id + body` wire form.
    pub fn write_bytes<W: Write>(&self, mut writer: W) -> io::Result<()> {
        match self {
            Message::KeepAlive => writer.write_u32::<BigEndian>(0),
            Message::Choke => write_header(&mut writer, 1, CHOKE_ID),
            Message::Unchoke => write_header(&mut writer, 1, UNCHOKE_ID),
            Message::Interested => write_header(&mut writer, 1, INTERESTED_ID),
            Message::NotInterested => write_header(&mut writer, 1, NOT_INTERESTED_ID),
            Message::Have { index } => {
                write_header(&mut writer, 5, HAVE_ID)?;
                writer.write_u32::<BigEndian>(*index)
            }
            Message::Bitfield { bytes } => {
                write_header(&mut writer, 1 + bytes.len() as u32, BITFIELD_ID)?;
                writer.write_all(bytes)
            }
            Message::Request { index, offset, length } => {
                write_header(&mut writer, 13, REQUEST_ID)?;
                writer.write_u32::<BigEndian>(*index)?;
                writer.write_u32::<BigEndian>(*offset)?;
                writer.write_u32::<BigEndian>(*length)
            }
            Message::Piece { index, offset, bytes } => {
                write_header(&mut writer, 9 + bytes.len() as u32, PIECE_ID)?;
                writer.write_u32::<BigEndian>(*index)?;
                writer.write_u32::<BigEndian>(*offset)?;
                writer.write_all(bytes)
            }
            Message::Cancel { index, offset, length } => {
                write_header(&mut writer, 13, CANCEL_ID)?;
                writer.write_u32::<BigEndian>(*index)?;
                writer.write_u32::<BigEndian>(*offset)?;
                writer.write_u32::<BigEndian>(*length)
            }
            Message::Port { port } => {
                write_header(&mut writer, 3, PORT_ID)?;
                writer.write_u16::<BigEndian>(*port)
            }
            Message::Extension { ext_id, payload } => {
                write_header(&mut writer, 2 + payload.len() as u32, EXTENSION_ID)?;
                writer.write_u8(*ext_id)?;
                writer.write_all(payload)
            }
        }
    }
}

fn write_header<W: Write>(writer: &mut W, length: u32, id: u8) -> io::Result<()> {
    writer.write_u32::<BigEndian>(length)?;
    writer.write_u8(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let mut buf = Vec::new();
        msg.write_bytes(&mut buf).unwrap();
        let length = (&buf[0..4]).read_u32::<BigEndian>().unwrap();
        assert_eq!(length as usize, buf.len() - 4);
        if length == 0 {
            assert!(matches!(msg, Message::KeepAlive));
            return;
        }
        let id = buf[4];
        let parsed = Message::parse(id, &buf[5..]).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn keep_alive_round_trips() {
        round_trip(Message::KeepAlive);
    }

    #[test]
    fn have_round_trips() {
        round_trip(Message::Have { index: 42 });
    }

    #[test]
    fn request_round_trips() {
        round_trip(Message::Request { index: 1, offset: 0, length: 16384 });
    }

    #[test]
    fn piece_round_trips() {
        round_trip(Message::Piece { index: 1, offset: 0, bytes: vec![1, 2, 3, 4] });
    }

    #[test]
    fn request_rejects_zero_length() {
        let body = [0u8, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(Message::parse(REQUEST_ID, &body), Err(ParseError::BadRequestLength(0))));
    }

    #[test]
    fn unknown_id_is_an_error() {
        assert!(matches!(Message::parse(255, &[]), Err(ParseError::UnknownId(255))));
    }
}
