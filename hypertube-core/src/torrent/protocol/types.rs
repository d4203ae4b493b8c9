//! Core types for the BitTorrent peer wire protocol

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// Protocol string sent in every handshake.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// BitTorrent peer identifier.
///
/// 20-byte identifier exchanged in handshakes and tracker announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a random peer ID starting with the client prefix.
    ///
    /// Prefixes longer than 20 bytes are truncated.
    pub fn generate(client_prefix: &str) -> Self {
        let mut id: [u8; 20] = rand::random();
        let prefix = client_prefix.as_bytes();
        let len = prefix.len().min(id.len());
        id[..len].copy_from_slice(&prefix[..len]);
        Self(id)
    }
}

/// BitTorrent wire protocol messages.
///
/// Keep-alives have no message id and are represented by the codec
/// returning `None` rather than by a variant.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Remote stops serving our requests
    Choke,
    /// Remote starts serving our requests
    Unchoke,
    Interested,
    NotInterested,
    /// Sender acquired a piece
    Have { piece_index: PieceIndex },
    /// Sender's complete piece availability bitmap
    Bitfield { bitfield: Bytes },
    /// Request a block of data from a piece
    Request {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// A block of piece data
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    /// Cancel a previously sent request
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// DHT listen port
    Port { port: u16 },
    /// Extension or unknown message, carried through so callers can ignore it
    Unknown { id: u8, payload: Bytes },
}

impl PeerMessage {
    /// Wire id of the message.
    pub fn id(&self) -> u8 {
        match self {
            PeerMessage::Choke => 0,
            PeerMessage::Unchoke => 1,
            PeerMessage::Interested => 2,
            PeerMessage::NotInterested => 3,
            PeerMessage::Have { .. } => 4,
            PeerMessage::Bitfield { .. } => 5,
            PeerMessage::Request { .. } => 6,
            PeerMessage::Piece { .. } => 7,
            PeerMessage::Cancel { .. } => 8,
            PeerMessage::Port { .. } => 9,
            PeerMessage::Unknown { id, .. } => *id,
        }
    }
}

/// Peer handshake information.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Protocol identifier, "BitTorrent protocol" for compliant peers
    pub protocol: String,
    /// Reserved extension bits
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            protocol: PROTOCOL_STRING.to_string(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}
