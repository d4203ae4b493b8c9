//! Bencode decoding of `.torrent` files into [`TorrentMetadata`]
//!
//! Both info dictionary schemas are decoded. The info hash is the SHA-1 of
//! the re-encoded dictionary, which `serde_bencode` writes with sorted keys.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use super::types::{TorrentFile, TorrentLayout, TorrentMetadata};
use crate::torrent::{InfoHash, TorrentError};

const PIECE_HASH_LEN: usize = 20;

#[derive(Debug, Deserialize)]
struct RawTorrent<I> {
    #[serde(default)]
    announce: String,
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    info: I,
}

#[derive(Debug, Serialize, Deserialize)]
struct SingleFileInfo {
    #[serde(default)]
    length: u64,
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MultiFileInfo {
    files: Vec<RawFile>,
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    length: u64,
    path: Vec<String>,
}

/// Bencode metadata decoder.
pub struct BencodeParser;

impl BencodeParser {
    /// Decodes raw `.torrent` bytes.
    ///
    /// The single-file schema wins when its `length` is non-zero, otherwise
    /// the multi-file schema is authoritative.
    ///
    /// # Errors
    /// - `TorrentError::MalformedMetadata` - Neither schema decodes, or the
    ///   pieces string is not a multiple of 20 bytes
    pub fn parse_bencode_data(data: &[u8]) -> Result<TorrentMetadata, TorrentError> {
        let single = serde_bencode::from_bytes::<RawTorrent<SingleFileInfo>>(data);
        let single_error = match single {
            Ok(raw) if raw.info.length > 0 => return Self::from_single_file(raw),
            Ok(_) => "single-file info has no length".to_string(),
            Err(e) => e.to_string(),
        };

        match serde_bencode::from_bytes::<RawTorrent<MultiFileInfo>>(data) {
            Ok(raw) => Self::from_multi_file(raw),
            Err(multi_error) => Err(TorrentError::MalformedMetadata {
                reason: format!(
                    "not a single-file torrent ({single_error}) nor a multi-file torrent ({multi_error})"
                ),
            }),
        }
    }

    fn from_single_file(raw: RawTorrent<SingleFileInfo>) -> Result<TorrentMetadata, TorrentError> {
        let info_hash = Self::hash_info(&raw.info)?;
        let piece_hashes = Self::split_piece_hashes(&raw.info.pieces)?;
        let file = TorrentFile {
            path: vec![raw.info.name.clone()],
            length: raw.info.length,
        };

        Ok(TorrentMetadata {
            info_hash,
            name: raw.info.name,
            announce: raw.announce,
            announce_list: Self::flatten_tiers(raw.announce_list),
            piece_length: raw.info.piece_length,
            piece_hashes,
            total_length: raw.info.length,
            layout: TorrentLayout::SingleFile { file },
        })
    }

    fn from_multi_file(raw: RawTorrent<MultiFileInfo>) -> Result<TorrentMetadata, TorrentError> {
        let info_hash = Self::hash_info(&raw.info)?;
        let piece_hashes = Self::split_piece_hashes(&raw.info.pieces)?;
        let files: Vec<TorrentFile> = raw
            .info
            .files
            .iter()
            .map(|file| TorrentFile {
                path: file.path.clone(),
                length: file.length,
            })
            .collect();
        let total_length = files.iter().map(|file| file.length).sum();

        Ok(TorrentMetadata {
            info_hash,
            name: raw.info.name,
            announce: raw.announce,
            announce_list: Self::flatten_tiers(raw.announce_list),
            piece_length: raw.info.piece_length,
            piece_hashes,
            total_length,
            layout: TorrentLayout::MultiFile { files },
        })
    }

    fn hash_info<I: Serialize>(info: &I) -> Result<InfoHash, TorrentError> {
        let encoded =
            serde_bencode::to_bytes(info).map_err(|e| TorrentError::MalformedMetadata {
                reason: format!("failed to re-encode info dictionary: {e}"),
            })?;
        let digest: [u8; 20] = Sha1::digest(&encoded).into();
        Ok(InfoHash::new(digest))
    }

    /// Splits the concatenated `pieces` string into 20-byte SHA-1 digests.
    ///
    /// # Errors
    /// - `TorrentError::MalformedMetadata` - Length is not a multiple of 20
    pub fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; 20]>, TorrentError> {
        if pieces.len() % PIECE_HASH_LEN != 0 {
            return Err(TorrentError::MalformedMetadata {
                reason: format!("received malformed pieces of length {}", pieces.len()),
            });
        }

        Ok(pieces
            .chunks_exact(PIECE_HASH_LEN)
            .map(|chunk| {
                let mut hash = [0u8; PIECE_HASH_LEN];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    fn flatten_tiers(tiers: Vec<Vec<String>>) -> Vec<String> {
        tiers.into_iter().flatten().collect()
    }
}
