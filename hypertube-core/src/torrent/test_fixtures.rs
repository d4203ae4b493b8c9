//! Torrent fixtures for tests
//!
//! Builds bencoded `.torrent` files by hand, independent of the parser, so
//! tests can check decoding and info hashing against known bytes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::protocol::{Bitfield, HandshakeCodec, MessageCodec, PeerHandshake, PeerId, PeerMessage};
use super::InfoHash;

/// Built torrent file plus the content it describes.
#[derive(Debug, Clone)]
pub struct TorrentFixture {
    pub bytes: Vec<u8>,
    /// Concatenated content of all files
    pub content: Vec<u8>,
    /// SHA-1 of the info dictionary exactly as written
    pub info_hash: InfoHash,
    pub piece_length: u32,
}

impl TorrentFixture {
    /// Content of one piece.
    pub fn piece(&self, index: usize) -> &[u8] {
        let begin = index * self.piece_length as usize;
        let end = (begin + self.piece_length as usize).min(self.content.len());
        &self.content[begin..end]
    }

    /// Number of pieces.
    pub fn piece_count(&self) -> usize {
        self.content.len().div_ceil(self.piece_length as usize)
    }
}

/// Builder for single-file and multi-file torrent fixtures.
pub struct TorrentFixtureBuilder {
    name: String,
    announce: Option<String>,
    announce_list: Vec<String>,
    piece_length: u32,
    files: Vec<(Vec<String>, Vec<u8>)>,
}

impl TorrentFixtureBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            announce: None,
            announce_list: Vec::new(),
            piece_length: 16384,
            files: Vec::new(),
        }
    }

    pub fn announce(mut self, url: &str) -> Self {
        self.announce = Some(url.to_string());
        self
    }

    /// Adds a fallback tracker as its own tier.
    pub fn fallback(mut self, url: &str) -> Self {
        self.announce_list.push(url.to_string());
        self
    }

    pub fn piece_length(mut self, piece_length: u32) -> Self {
        self.piece_length = piece_length;
        self
    }

    /// Adds a file for a multi-file torrent.
    pub fn file(mut self, path: &[&str], content: Vec<u8>) -> Self {
        self.files
            .push((path.iter().map(|s| s.to_string()).collect(), content));
        self
    }

    /// Builds a single-file torrent around `content`.
    pub fn build_single(self, content: Vec<u8>) -> TorrentFixture {
        let mut info = Vec::new();
        info.push(b'd');
        write_str(&mut info, b"length");
        write_int(&mut info, content.len() as i64);
        write_str(&mut info, b"name");
        write_str(&mut info, self.name.as_bytes());
        write_str(&mut info, b"piece length");
        write_int(&mut info, self.piece_length as i64);
        write_str(&mut info, b"pieces");
        write_str(&mut info, &piece_hashes(self.piece_length, &content));
        info.push(b'e');

        self.finish(info, content)
    }

    /// Builds a multi-file torrent from the files added so far.
    pub fn build_multi(self) -> TorrentFixture {
        let content: Vec<u8> = self
            .files
            .iter()
            .flat_map(|(_, data)| data.iter().copied())
            .collect();

        let mut info = Vec::new();
        info.push(b'd');
        write_str(&mut info, b"files");
        info.push(b'l');
        for (path, data) in &self.files {
            info.push(b'd');
            write_str(&mut info, b"length");
            write_int(&mut info, data.len() as i64);
            write_str(&mut info, b"path");
            info.push(b'l');
            for segment in path {
                write_str(&mut info, segment.as_bytes());
            }
            info.push(b'e');
            info.push(b'e');
        }
        info.push(b'e');
        write_str(&mut info, b"name");
        write_str(&mut info, self.name.as_bytes());
        write_str(&mut info, b"piece length");
        write_int(&mut info, self.piece_length as i64);
        write_str(&mut info, b"pieces");
        write_str(&mut info, &piece_hashes(self.piece_length, &content));
        info.push(b'e');

        self.finish(info, content)
    }

    fn finish(self, info: Vec<u8>, content: Vec<u8>) -> TorrentFixture {
        let info_hash = InfoHash::new(Sha1::digest(&info).into());

        let mut bytes = Vec::new();
        bytes.push(b'd');
        if let Some(announce) = &self.announce {
            write_str(&mut bytes, b"announce");
            write_str(&mut bytes, announce.as_bytes());
        }
        if !self.announce_list.is_empty() {
            write_str(&mut bytes, b"announce-list");
            bytes.push(b'l');
            for url in &self.announce_list {
                bytes.push(b'l');
                write_str(&mut bytes, url.as_bytes());
                bytes.push(b'e');
            }
            bytes.push(b'e');
        }
        write_str(&mut bytes, b"info");
        bytes.extend_from_slice(&info);
        bytes.push(b'e');

        TorrentFixture {
            bytes,
            content,
            info_hash,
            piece_length: self.piece_length,
        }
    }
}

/// Concatenated SHA-1 digests of each piece of `content`.
pub fn piece_hashes(piece_length: u32, content: &[u8]) -> Vec<u8> {
    content
        .chunks(piece_length as usize)
        .flat_map(|piece| Sha1::digest(piece).to_vec())
        .collect()
}

/// Deterministic non-repeating-looking content of `len` bytes.
pub fn pattern_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

fn write_str(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(value.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(value);
}

fn write_int(buf: &mut Vec<u8>, value: i64) {
    buf.push(b'i');
    buf.extend_from_slice(value.to_string().as_bytes());
    buf.push(b'e');
}

/// How a fake seeder answers block requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeederBehavior {
    /// Serves the requested bytes
    Honest,
    /// Serves blocks with every byte inverted
    Corrupt,
    /// Unchokes but never answers requests
    Stall,
    /// Never unchokes
    Choking,
}

/// Counters shared with a running fake seeder.
#[derive(Debug, Default)]
pub struct SeederStats {
    pub connections: AtomicUsize,
    pub blocks_served: AtomicUsize,
    pub haves_received: AtomicUsize,
}

/// Running fake seeder.
pub struct SeederHandle {
    pub address: SocketAddr,
    pub stats: Arc<SeederStats>,
}

/// Starts a loopback seeder owning `pieces` of `fixture`.
///
/// It accepts any number of connections, advertises its pieces with a
/// bitfield, unchokes after `interested` and answers requests per `behavior`.
pub async fn spawn_seeder(
    fixture: TorrentFixture,
    pieces: Vec<usize>,
    behavior: SeederBehavior,
) -> SeederHandle {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind seeder listener");
    let address = listener.local_addr().expect("seeder address");
    let stats = Arc::new(SeederStats::default());
    let fixture = Arc::new(fixture);

    let task_stats = stats.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            task_stats.connections.fetch_add(1, Ordering::SeqCst);
            let fixture = fixture.clone();
            let pieces = pieces.clone();
            let stats = task_stats.clone();
            tokio::spawn(async move {
                let _ = serve_peer(socket, &fixture, &pieces, behavior, &stats).await;
            });
        }
    });

    SeederHandle { address, stats }
}

async fn serve_peer(
    mut socket: TcpStream,
    fixture: &TorrentFixture,
    pieces: &[usize],
    behavior: SeederBehavior,
    stats: &SeederStats,
) -> std::io::Result<()> {
    let mut handshake = vec![0u8; 68];
    socket.read_exact(&mut handshake).await?;
    let reply = PeerHandshake::new(fixture.info_hash, PeerId::generate("-FS0001-"));
    socket
        .write_all(&HandshakeCodec::serialize_handshake(&reply))
        .await?;

    let mut bitfield = Bitfield::empty(fixture.piece_count());
    for &piece in pieces {
        bitfield.set_piece(piece);
    }
    let message = PeerMessage::Bitfield {
        bitfield: bitfield.to_bytes(),
    };
    socket
        .write_all(&MessageCodec::serialize_message(&message))
        .await?;

    loop {
        let mut length = [0u8; 4];
        socket.read_exact(&mut length).await?;
        let length = u32::from_be_bytes(length) as usize;
        if length == 0 {
            continue;
        }
        let mut body = vec![0u8; length];
        socket.read_exact(&mut body).await?;

        let Ok(message) = MessageCodec::decode_body(&body) else {
            continue;
        };
        match message {
            PeerMessage::Interested if behavior != SeederBehavior::Choking => {
                socket
                    .write_all(&MessageCodec::serialize_message(&PeerMessage::Unchoke))
                    .await?;
            }
            PeerMessage::Have { .. } => {
                stats.haves_received.fetch_add(1, Ordering::SeqCst);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } if behavior == SeederBehavior::Honest || behavior == SeederBehavior::Corrupt => {
                let piece = fixture.piece(piece_index.as_usize());
                let begin = offset as usize;
                let end = (begin + length as usize).min(piece.len());
                let mut data = piece[begin..end].to_vec();
                if behavior == SeederBehavior::Corrupt {
                    data.iter_mut().for_each(|byte| *byte = !*byte);
                }
                let block = PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::from(data),
                };
                socket
                    .write_all(&MessageCodec::serialize_message(&block))
                    .await?;
                stats.blocks_served.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}
