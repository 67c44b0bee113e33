//! BitTorrent handshake
//!
//! The first 68 bytes exchanged on every peer connection.

use bytes::{BufMut, BytesMut};
use anyhow::Result;
use tracing::{debug, error, trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total length of a handshake on the wire
pub const HANDSHAKE_LEN: usize = 68;

/// Byte range of the info hash inside a serialized handshake
const INFO_HASH_RANGE: std::ops::Range<usize> = 28..48;

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved bytes, always zero when we send
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with info_hash and peer_id
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating new handshake for info_hash: {}", hex::encode(info_hash));
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Append the serialized handshake to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        trace!("Serializing handshake");
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
    }

    /// Deserialize a handshake from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        if data.len() < HANDSHAKE_LEN {
            error!("Handshake data too short: expected {} bytes, got {}", HANDSHAKE_LEN, data.len());
            return Err(TorrentError::protocol_error_with_source(
                "Handshake data too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len())
            ).into());
        }

        let protocol_length = data[0];
        if protocol_length != PROTOCOL_LENGTH {
            error!("Invalid protocol length: expected {}, got {}", PROTOCOL_LENGTH, protocol_length);
            return Err(TorrentError::protocol_error_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, protocol_length)
            ).into());
        }

        if &data[1..20] != PROTOCOL_STRING {
            error!("Invalid protocol string");
            return Err(TorrentError::protocol_error("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[INFO_HASH_RANGE]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        debug!("Handshake peer_id: {}", hex::encode(peer_id));

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Check the remote handshake against our info hash
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!("Handshake validation failed: info hash mismatch");
            warn!("  Expected: {}", hex::encode(expected_info_hash));
            warn!("  Got:      {}", hex::encode(self.info_hash));
            return false;
        }
        true
    }

    /// Parse and validate in one step, failing with a protocol error on mismatch
    pub fn accept(data: &[u8], expected_info_hash: &[u8; 20]) -> Result<Self> {
        let handshake = Self::deserialize(data)?;
        if !handshake.validate(expected_info_hash) {
            return Err(TorrentError::protocol_error_with_source(
                "Handshake info hash mismatch",
                hex::encode(handshake.info_hash)
            ).into());
        }
        Ok(handshake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let serialized = handshake.serialize();

        assert_eq!(serialized.len(), HANDSHAKE_LEN);
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], b"BitTorrent protocol");
        assert_eq!(&serialized[20..28], &[0u8; 8]);
        assert_eq!(&serialized[28..48], &[1u8; 20]);
        assert_eq!(&serialized[48..68], &[2u8; 20]);

        let parsed = Handshake::deserialize(&serialized).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn test_accept_rejects_foreign_info_hash() {
        let ours = [1u8; 20];
        let mut data = Handshake::new(ours, [2u8; 20]).serialize();
        assert!(Handshake::accept(&data, &ours).is_ok());

        data[40] ^= 0xff;
        let err = Handshake::accept(&data, &ours).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::ProtocolError { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_protocol_string() {
        let mut data = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        data[5] = b'x';
        assert!(Handshake::deserialize(&data).is_err());
        assert!(Handshake::deserialize(&data[..40]).is_err());
    }
}
