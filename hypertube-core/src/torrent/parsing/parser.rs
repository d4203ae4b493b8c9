//! Torrent parser entry points

use std::path::Path;

use super::super::TorrentError;
use super::bencode::BencodeParser;
use super::types::TorrentMetadata;

/// Parser for `.torrent` files backed by `serde_bencode`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BencodeTorrentParser;

impl BencodeTorrentParser {
    /// Creates new bencode parser instance.
    pub fn new() -> Self {
        Self
    }

    /// Parses torrent metadata from raw bencode bytes.
    ///
    /// # Errors
    /// - `TorrentError::MalformedMetadata` - Malformed bencode, missing fields
    ///   or a bad piece hash blob
    pub fn parse_torrent_data(&self, data: &[u8]) -> Result<TorrentMetadata, TorrentError> {
        BencodeParser::parse_bencode_data(data)
    }

    /// Reads and parses a `.torrent` file from disk.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File could not be read
    /// - `TorrentError::MalformedMetadata` - Parsing failure
    pub async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentMetadata, TorrentError> {
        let file_contents = tokio::fs::read(path).await?;

        self.parse_torrent_data(&file_contents)
    }
}
