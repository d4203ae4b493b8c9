//! Tracker wire formats: compact peers and BEP 15 UDP packets

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use bytes::{Buf, BufMut};

use super::types::{AnnounceRequest, AnnounceResponse, ScrapeStats};
use crate::torrent::{InfoHash, TorrentError};

/// Magic constant opening every UDP connect request.
pub const PROTOCOL_ID: u64 = 0x41727101980;

pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_SCRAPE: u32 = 2;
pub const ACTION_ERROR: u32 = 3;

const COMPACT_PEER_LEN: usize = 6;
const RESPONSE_HEADER_LEN: usize = 8;
const ANNOUNCE_HEADER_LEN: usize = 20;

/// Decodes a compact peer list, 4 bytes IPv4 and 2 bytes port per peer.
///
/// # Errors
/// - `TorrentError::ProtocolError` - Length is not a multiple of 6
pub fn parse_compact_peers(peer_bytes: &[u8]) -> Result<Vec<SocketAddr>, TorrentError> {
    if peer_bytes.len() % COMPACT_PEER_LEN != 0 {
        return Err(TorrentError::ProtocolError {
            message: format!("Invalid compact peer data length {}", peer_bytes.len()),
        });
    }

    Ok(peer_bytes
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}

/// Action and transaction id common to every UDP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpResponseHeader {
    pub action: u32,
    pub transaction_id: u32,
}

impl UdpResponseHeader {
    /// Reads the 8-byte response header.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Packet shorter than 8 bytes
    pub fn parse(packet: &[u8]) -> Result<Self, TorrentError> {
        if packet.len() < RESPONSE_HEADER_LEN {
            return Err(TorrentError::ProtocolError {
                message: format!("UDP tracker response of {} bytes is too short", packet.len()),
            });
        }
        let mut buf = packet;
        Ok(Self {
            action: buf.get_u32(),
            transaction_id: buf.get_u32(),
        })
    }
}

/// Builds the 16-byte connect request.
pub fn connect_request(transaction_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.put_u64(PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf
}

/// Extracts the connection id from a connect response.
pub fn parse_connect_response(packet: &[u8]) -> Result<u64, TorrentError> {
    if packet.len() < 16 {
        return Err(TorrentError::ProtocolError {
            message: format!("UDP connect response of {} bytes is too short", packet.len()),
        });
    }
    let mut buf = &packet[RESPONSE_HEADER_LEN..];
    Ok(buf.get_u64())
}

/// Builds the 98-byte announce request.
pub fn announce_request(
    connection_id: u64,
    transaction_id: u32,
    request: &AnnounceRequest,
    key: u32,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(98);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.extend_from_slice(request.info_hash.as_bytes());
    buf.extend_from_slice(request.peer_id.as_bytes());
    buf.put_u64(request.downloaded);
    buf.put_u64(request.left);
    buf.put_u64(request.uploaded);
    buf.put_u32(0); // event: none
    buf.put_u32(0); // ip: sender address
    buf.put_u32(key);
    buf.put_i32(request.num_want);
    buf.put_u16(request.port);
    buf
}

/// Parses interval, leechers, seeders and the trailing compact peers.
pub fn parse_announce_response(packet: &[u8]) -> Result<AnnounceResponse, TorrentError> {
    if packet.len() < ANNOUNCE_HEADER_LEN {
        return Err(TorrentError::ProtocolError {
            message: format!("UDP announce response of {} bytes is too short", packet.len()),
        });
    }
    let mut buf = &packet[RESPONSE_HEADER_LEN..ANNOUNCE_HEADER_LEN];
    let interval = buf.get_u32();
    let leechers = buf.get_u32();
    let seeders = buf.get_u32();

    Ok(AnnounceResponse {
        interval: (interval > 0).then(|| Duration::from_secs(interval as u64)),
        seeders: Some(seeders),
        leechers: Some(leechers),
        peers: parse_compact_peers(&packet[ANNOUNCE_HEADER_LEN..])?,
    })
}

/// Builds a scrape request for one torrent.
pub fn scrape_request(connection_id: u64, transaction_id: u32, info_hash: &InfoHash) -> Vec<u8> {
    let mut buf = Vec::with_capacity(36);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_SCRAPE);
    buf.put_u32(transaction_id);
    buf.extend_from_slice(info_hash.as_bytes());
    buf
}

/// Parses the first torrent's statistics from a scrape response.
pub fn parse_scrape_response(packet: &[u8]) -> Result<ScrapeStats, TorrentError> {
    if packet.len() < 20 {
        return Err(TorrentError::ProtocolError {
            message: format!("UDP scrape response of {} bytes is too short", packet.len()),
        });
    }
    let mut buf = &packet[RESPONSE_HEADER_LEN..20];
    Ok(ScrapeStats {
        seeders: buf.get_u32(),
        completed: buf.get_u32(),
        leechers: buf.get_u32(),
    })
}

/// Message carried by an error response.
pub fn parse_error_message(packet: &[u8]) -> String {
    String::from_utf8_lossy(packet.get(RESPONSE_HEADER_LEN..).unwrap_or_default()).to_string()
}
