//! BitTorrent handshake serialization and validation

use super::types::{PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Handshake length without the protocol string.
pub const HANDSHAKE_BASE_LEN: usize = 49;

/// Longest protocol string a handshake can carry.
pub const MAX_PROTOCOL_LEN: usize = u8::MAX as usize;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes a handshake into `49 + len(pstr)` bytes.
    ///
    /// The length prefix is one byte, so protocol strings longer than
    /// `MAX_PROTOCOL_LEN` bytes are cut to that length.
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let bytes = handshake.protocol.as_bytes();
        let protocol = &bytes[..bytes.len().min(MAX_PROTOCOL_LEN)];
        let mut buf = Vec::with_capacity(HANDSHAKE_BASE_LEN + protocol.len());

        buf.push(protocol.len() as u8);
        buf.extend_from_slice(protocol);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());

        buf
    }

    /// Total handshake length announced by its first byte.
    pub fn expected_len(protocol_len: u8) -> usize {
        HANDSHAKE_BASE_LEN + protocol_len as usize
    }

    /// Deserializes a complete handshake.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Empty protocol string or wrong length
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, TorrentError> {
        let Some(&protocol_len) = data.first() else {
            return Err(TorrentError::ProtocolError {
                message: "Empty handshake".to_string(),
            });
        };
        if protocol_len == 0 {
            return Err(TorrentError::ProtocolError {
                message: "Handshake protocol string length cannot be 0".to_string(),
            });
        }
        if data.len() != Self::expected_len(protocol_len) {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "Invalid handshake length {}, expected {}",
                    data.len(),
                    Self::expected_len(protocol_len)
                ),
            });
        }

        let protocol_end = 1 + protocol_len as usize;
        let protocol = String::from_utf8_lossy(&data[1..protocol_end]).to_string();

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[protocol_end..protocol_end + 8]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[protocol_end + 8..protocol_end + 28]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[protocol_end + 28..protocol_end + 48]);

        Ok(PeerHandshake {
            protocol,
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }

    /// Checks the remote handshake belongs to the expected torrent.
    ///
    /// # Errors
    /// - `TorrentError::HandshakeMismatch` - Remote info hash differs
    pub fn validate(handshake: &PeerHandshake, expected: InfoHash) -> Result<(), TorrentError> {
        if handshake.info_hash != expected {
            return Err(TorrentError::HandshakeMismatch {
                expected,
                actual: handshake.info_hash,
            });
        }
        Ok(())
    }
}
