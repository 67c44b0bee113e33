//! BitTorrent protocol messages
//!
//! Every message after the handshake is a 4-byte big-endian length prefix
//! followed by a 1-byte id and an id-specific payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use anyhow::Result;
use tracing::{error, trace};

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    /// Reserved; never sent and skipped when received
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => Err(TorrentError::protocol_error_with_source(
                "Invalid message ID",
                format!("value: {}", value)
            ).into()),
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    /// A message whose id this client does not handle; its payload was skipped
    Unknown { id: u8, length: usize },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive and unknown ids)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::KeepAlive | Message::Unknown { .. } => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Unknown { length, .. } => *length as u32,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Append the framed message to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        trace!("Encoding message: {:?}", self.message_id());
        if let Message::Unknown { .. } = self {
            return;
        }

        buf.put_u32(self.length());

        match self {
            Message::KeepAlive | Message::Unknown { .. } => {}
            Message::Choke => buf.put_u8(MessageId::Choke as u8),
            Message::Unchoke => buf.put_u8(MessageId::Unchoke as u8),
            Message::Interested => buf.put_u8(MessageId::Interested as u8),
            Message::NotInterested => buf.put_u8(MessageId::NotInterested as u8),
            Message::Have { piece_index } => {
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece_index);
            }
            Message::Bitfield { bitfield } => {
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bitfield);
            }
            Message::Request { index, begin, length } => {
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel { index, begin, length } => {
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
        }
    }

    /// Parse one frame body (the bytes after the length prefix)
    ///
    /// Fixed-size messages must have exactly their documented length.
    /// Ids this client does not handle come back as [`Message::Unknown`].
    pub fn parse(mut frame: Bytes) -> Result<Self> {
        let length = frame.len();
        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        let id = frame.get_u8();
        let message_id = match MessageId::try_from(id) {
            Ok(MessageId::Port) | Err(_) => {
                trace!("Skipping message with id {} ({} bytes)", id, length);
                return Ok(Message::Unknown { id, length });
            }
            Ok(message_id) => message_id,
        };

        match message_id {
            MessageId::Choke => expect_len(message_id, length, 1).map(|_| Message::Choke),
            MessageId::Unchoke => expect_len(message_id, length, 1).map(|_| Message::Unchoke),
            MessageId::Interested => expect_len(message_id, length, 1).map(|_| Message::Interested),
            MessageId::NotInterested => {
                expect_len(message_id, length, 1).map(|_| Message::NotInterested)
            }
            MessageId::Have => {
                expect_len(message_id, length, 5)?;
                Ok(Message::Have { piece_index: frame.get_u32() })
            }
            MessageId::Bitfield => Ok(Message::Bitfield { bitfield: frame }),
            MessageId::Request | MessageId::Cancel => {
                expect_len(message_id, length, 13)?;
                let index = frame.get_u32();
                let begin = frame.get_u32();
                let block_len = frame.get_u32();
                if message_id == MessageId::Request {
                    Ok(Message::Request { index, begin, length: block_len })
                } else {
                    Ok(Message::Cancel { index, begin, length: block_len })
                }
            }
            MessageId::Piece => {
                if length < 9 {
                    error!("Piece message too short: expected at least 9 bytes, got {}", length);
                    return Err(TorrentError::protocol_error_with_source(
                        "Piece message too short",
                        format!("expected at least 9 bytes, got {}", length)
                    ).into());
                }
                let index = frame.get_u32();
                let begin = frame.get_u32();
                Ok(Message::Piece { index, begin, block: frame })
            }
            MessageId::Port => Ok(Message::Unknown { id, length }),
        }
    }

    /// Deserialize a message from bytes (including length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(TorrentError::protocol_error("Missing length prefix").into());
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() - 4 != length {
            return Err(TorrentError::protocol_error_with_source(
                "Length prefix does not match message size",
                format!("prefix {}, body {}", length, data.len() - 4)
            ).into());
        }
        Self::parse(Bytes::copy_from_slice(&data[4..]))
    }
}

fn expect_len(id: MessageId, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        error!("{:?} message has length {}, expected {}", id, actual, expected);
        return Err(TorrentError::protocol_error_with_source(
            format!("Malformed {:?} message", id),
            format!("expected length {}, got {}", expected, actual)
        ).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_is_four_zero_bytes() {
        let serialized = Message::KeepAlive.serialize();
        assert_eq!(serialized, vec![0, 0, 0, 0]);
        assert_eq!(Message::deserialize(&serialized).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_request_wire_bytes() {
        let serialized = Message::Request { index: 1, begin: 16384, length: 16384 }.serialize();
        assert_eq!(
            serialized,
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_piece_message_parses_block() {
        let message = Message::Piece { index: 10, begin: 0, block: Bytes::from_static(&[1, 2, 3]) };
        let parsed = Message::deserialize(&message.serialize()).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_fixed_length_messages_are_strict() {
        // have with a 3-byte payload
        assert!(Message::parse(Bytes::from_static(&[4, 0, 0, 1])).is_err());
        // choke carrying a stray byte
        assert!(Message::parse(Bytes::from_static(&[0, 9])).is_err());
        // request missing its length field
        assert!(Message::parse(Bytes::from_static(&[6, 0, 0, 0, 1, 0, 0, 0, 0])).is_err());
        // piece without begin
        assert!(Message::parse(Bytes::from_static(&[7, 0, 0, 0, 1])).is_err());
    }

    #[test]
    fn test_unknown_ids_are_skipped() {
        let parsed = Message::parse(Bytes::from_static(&[20, 1, 2, 3])).unwrap();
        assert_eq!(parsed, Message::Unknown { id: 20, length: 4 });

        let parsed = Message::parse(Bytes::from_static(&[9, 0x1a, 0xe1])).unwrap();
        assert_eq!(parsed, Message::Unknown { id: 9, length: 3 });
    }

    #[test]
    fn test_message_length() {
        assert_eq!(Message::KeepAlive.length(), 0);
        assert_eq!(Message::Choke.length(), 1);
        assert_eq!(Message::Have { piece_index: 0 }.length(), 5);
        assert_eq!(Message::Cancel { index: 0, begin: 0, length: 0 }.length(), 13);
        assert_eq!(Message::Bitfield { bitfield: Bytes::from_static(&[0xff, 0x80]) }.length(), 3);
    }

    #[test]
    fn test_message_id_from_u8() {
        assert_eq!(MessageId::try_from(0).unwrap(), MessageId::Choke);
        assert_eq!(MessageId::try_from(8).unwrap(), MessageId::Cancel);
        assert!(MessageId::try_from(10).is_err());
    }
}
