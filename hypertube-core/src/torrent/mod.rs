//! BitTorrent download engine: metadata, wire protocol, trackers, peers and pieces

pub mod parsing;
pub mod pool;
pub mod protocol;
pub mod reassembly;
pub mod scheduler;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;
pub mod tracker;

use std::fmt;
use std::net::SocketAddr;

pub use parsing::{
    BencodeTorrentParser, MagnetResolver, TorrentFile, TorrentLayout, TorrentMetadata,
    UnconfiguredMagnetResolver, trackers_from_magnet,
};
pub use pool::{PeerPool, PeerPoolHandle};
pub use protocol::{Bitfield, PeerConnection, PeerHandshake, PeerId, PeerMessage};
pub use reassembly::Reassembler;
pub use scheduler::{LoadedPiece, PieceProgress, PieceResult, PieceScheduler, PieceWork};
pub use session::{DownloadSession, load_metadata};
pub use tracker::{
    AnnounceRequest, AnnounceResponse, HttpTrackerClient, Peer, PeerStatus, ScrapeStats,
    TrackerSet, TrackerTransport, UdpTrackerClient,
};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the bencoded info dictionary. Peers and trackers
/// use it to identify the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index for slice addressing.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Metadata and setup failures propagate to the caller. Tracker errors are
/// fatal to one tracker call, peer errors to one peer attempt, and piece
/// errors are turned into requeue actions by the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Malformed torrent metadata: {reason}")]
    MalformedMetadata { reason: String },

    #[error("Unsupported tracker scheme '{scheme}' in {url}")]
    UnsupportedTrackerScheme { scheme: String, url: String },

    #[error("Tracker {url} timed out during {stage}")]
    TrackerTimeout { url: String, stage: &'static str },

    #[error("Tracker {url} unreachable: {reason}")]
    TrackerUnreachable { url: String, reason: String },

    #[error("Handshake info hash mismatch: expected {expected}, got {actual}")]
    HandshakeMismatch { expected: InfoHash, actual: InfoHash },

    #[error("Peer {address} connection error: {reason}")]
    PeerConnectionError { address: SocketAddr, reason: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Peer {address} stalled while sending piece data")]
    StalledPeer { address: SocketAddr },

    #[error("Piece {index} failed integrity check")]
    IntegrityFailure { index: PieceIndex },

    #[error("No peers left to download {missing} missing pieces")]
    NoPeersAvailable { missing: usize },

    #[error("Magnet link resolution failed: {reason}")]
    MagnetResolution { reason: String },

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error")]
    UrlParsing(#[from] url::ParseError),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
        assert_eq!(piece2.as_usize(), 10);
    }

    #[test]
    fn test_handshake_mismatch_message_names_both_hashes() {
        let error = TorrentError::HandshakeMismatch {
            expected: InfoHash::new([0xaa; 20]),
            actual: InfoHash::new([0xbb; 20]),
        };
        let message = error.to_string();
        assert!(message.contains(&"aa".repeat(20)));
        assert!(message.contains(&"bb".repeat(20)));
    }
}
