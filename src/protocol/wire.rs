//! Wire framing
//!
//! Incremental extraction of handshakes and length-prefixed frames from a
//! receive buffer, so a session can be fed bytes as they arrive.

use bytes::{Buf, Bytes, BytesMut};
use anyhow::Result;
use tracing::error;

use super::handshake::{Handshake, HANDSHAKE_LEN};
use super::message::Message;
use crate::error::TorrentError;

/// Largest block a peer may ask for or send in one piece message
pub const MAX_BLOCK_LEN: usize = 1 << 17;

/// Frame size limit for a torrent with `piece_count` pieces
///
/// Large enough for a full bitfield or a maximal piece message.
pub fn max_frame_len(piece_count: usize) -> usize {
    let bitfield = 1 + (piece_count + 7) / 8;
    bitfield.max(9 + MAX_BLOCK_LEN)
}

/// Take a handshake off the front of `buf` once all 68 bytes are present
pub fn read_handshake(buf: &mut BytesMut, expected_info_hash: &[u8; 20]) -> Result<Option<Handshake>> {
    if buf.len() < HANDSHAKE_LEN {
        return Ok(None);
    }
    let raw = buf.split_to(HANDSHAKE_LEN);
    Handshake::accept(&raw, expected_info_hash).map(Some)
}

/// Take one length-prefixed frame body off the front of `buf`
///
/// Returns `Ok(None)` until the whole frame has arrived. A length prefix
/// larger than `max_len` is a protocol violation.
pub fn read_frame(buf: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > max_len {
        error!("Frame length {} exceeds limit {}", length, max_len);
        return Err(TorrentError::protocol_error_with_source(
            "Malformed message length",
            format!("{} > {}", length, max_len)
        ).into());
    }

    if buf.len() < 4 + length {
        buf.reserve(4 + length - buf.len());
        return Ok(None);
    }

    buf.advance(4);
    Ok(Some(buf.split_to(length).freeze()))
}

/// Take and parse the next complete message from `buf`
pub fn read_message(buf: &mut BytesMut, max_len: usize) -> Result<Option<Message>> {
    match read_frame(buf, max_len)? {
        Some(frame) => Message::parse(frame).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_frames_arrive_in_pieces() {
        let encoded = Message::Have { piece_index: 7 }.serialize();
        let mut buf = BytesMut::new();

        buf.put_slice(&encoded[..3]);
        assert!(read_message(&mut buf, 64).unwrap().is_none());
        buf.put_slice(&encoded[3..6]);
        assert!(read_message(&mut buf, 64).unwrap().is_none());
        buf.put_slice(&encoded[6..]);
        buf.put_slice(&Message::KeepAlive.serialize());

        assert_eq!(read_message(&mut buf, 64).unwrap(), Some(Message::Have { piece_index: 7 }));
        assert_eq!(read_message(&mut buf, 64).unwrap(), Some(Message::KeepAlive));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1_000_000);
        assert!(read_frame(&mut buf, max_frame_len(10)).is_err());
    }

    #[test]
    fn test_handshake_accumulates() {
        let info_hash = [5u8; 20];
        let encoded = Handshake::new(info_hash, [6u8; 20]).serialize();
        let mut buf = BytesMut::new();

        buf.put_slice(&encoded[..50]);
        assert!(read_handshake(&mut buf, &info_hash).unwrap().is_none());
        buf.put_slice(&encoded[50..]);
        buf.put_slice(&Message::Unchoke.serialize());

        let handshake = read_handshake(&mut buf, &info_hash).unwrap().unwrap();
        assert_eq!(handshake.peer_id, [6u8; 20]);
        assert_eq!(read_message(&mut buf, 64).unwrap(), Some(Message::Unchoke));
    }

    #[test]
    fn test_max_frame_len_covers_bitfield() {
        assert_eq!(max_frame_len(8), 9 + MAX_BLOCK_LEN);
        assert_eq!(max_frame_len(8 * 200_000), 1 + 200_000);
    }
}
