//! Core types for BitTorrent tracker communication

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::torrent::protocol::PeerId;
use crate::torrent::{InfoHash, TorrentError};

/// Tracker announce request.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// TCP port announced for incoming peer connections
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes remaining to download
    pub left: u64,
    /// Desired number of peers, -1 for the tracker default
    pub num_want: i32,
}

/// Tracker announce response.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceResponse {
    /// Minimum period before the next announce, `None` when not reported
    pub interval: Option<Duration>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

/// Swarm statistics reported by a UDP scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScrapeStats {
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

/// Lifecycle of a peer inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Reported by a tracker, not dialled yet
    Known,
    /// Activation in progress
    Connecting,
    /// Connection handed to the scheduler
    Activated,
    /// Dial, handshake or first message failed; never retried
    Dead,
}

/// Peer reported by a tracker.
///
/// Peers are never removed from the pool, only flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub address: SocketAddr,
    pub status: PeerStatus,
}

impl Peer {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            status: PeerStatus::Known,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.status == PeerStatus::Dead
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Source of peer lists for the pool.
///
/// Implemented by [`super::TrackerSet`]; tests substitute fixed lists.
#[async_trait]
pub trait TrackerManagement: Send {
    /// Announces and returns the peers the tracker knows about.
    ///
    /// # Errors
    /// - `TorrentError::TrackerTimeout` / `TrackerUnreachable` - No tracker answered
    /// - `TorrentError::UnsupportedTrackerScheme` - No usable tracker URL
    async fn announce(&mut self, request: &AnnounceRequest)
    -> Result<AnnounceResponse, TorrentError>;
}
