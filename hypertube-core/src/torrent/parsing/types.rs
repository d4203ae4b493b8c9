//! Core types produced by torrent metadata parsing

use sha1::{Digest, Sha1};

use super::super::{InfoHash, PieceIndex};

/// Complete metadata extracted from a torrent file.
///
/// Immutable once parsed. Holds everything the download session needs:
/// swarm identity, tracker URLs, piece hashes and the file layout.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    /// Primary tracker URL
    pub announce: String,
    /// Fallback tracker URLs in tier order
    pub announce_list: Vec<String>,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub layout: TorrentLayout,
}

/// File layout of a torrent, fixed at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum TorrentLayout {
    /// Info dictionary carries `length` and the content is one file named `name`
    SingleFile { file: TorrentFile },
    /// Info dictionary carries a `files` list
    MultiFile { files: Vec<TorrentFile> },
}

/// Individual file within a torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
}

impl TorrentFile {
    /// Stable on-disk name derived from the path segments.
    ///
    /// Lowercase hex SHA-1 of the concatenated segments, so names never
    /// contain separators or characters the filesystem rejects.
    pub fn encoded_file_name(&self) -> String {
        let mut hasher = Sha1::new();
        for segment in &self.path {
            hasher.update(segment.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Path segments joined with `/` for display.
    pub fn display_path(&self) -> String {
        self.path.join("/")
    }
}

impl TorrentLayout {
    /// Files in declared order.
    pub fn files(&self) -> &[TorrentFile] {
        match self {
            TorrentLayout::SingleFile { file } => std::slice::from_ref(file),
            TorrentLayout::MultiFile { files } => files,
        }
    }

    /// Whether pieces may straddle file boundaries.
    pub fn is_multi_file(&self) -> bool {
        matches!(self, TorrentLayout::MultiFile { .. })
    }
}

impl TorrentMetadata {
    /// Files in declared order.
    pub fn files(&self) -> &[TorrentFile] {
        self.layout.files()
    }

    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Absolute `[begin, end)` byte range of a piece, clamped to the total length.
    pub fn piece_bounds(&self, index: PieceIndex) -> (u64, u64) {
        let begin = index.as_u32() as u64 * self.piece_length as u64;
        let end = (begin + self.piece_length as u64).min(self.total_length);
        (begin.min(self.total_length), end)
    }

    /// Size of a piece in bytes; only the last piece may be shorter.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let (begin, end) = self.piece_bounds(index);
        (end - begin) as u32
    }

    /// Largest file of the torrent, the one exposed for streaming.
    ///
    /// Ties resolve to the first declared file.
    pub fn heaviest_file(&self) -> Option<&TorrentFile> {
        self.files()
            .iter()
            .reduce(|best, file| if file.length > best.length { file } else { best })
    }

    /// Primary announce URL followed by the fallbacks, without duplicates.
    pub fn tracker_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for url in std::iter::once(&self.announce).chain(self.announce_list.iter()) {
            if !url.is_empty() && !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}
