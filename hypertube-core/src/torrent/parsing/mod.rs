//! Torrent metadata parsing and magnet link handling.
//!
//! Decodes single-file and multi-file `.torrent` files with `serde_bencode`
//! and derives the info hash from the re-encoded info dictionary.

pub mod bencode;
pub mod magnet;
pub mod parser;
pub mod types;

pub use magnet::{MagnetResolver, UnconfiguredMagnetResolver, is_magnet_link, trackers_from_magnet};
pub use parser::BencodeTorrentParser;
pub use types::{TorrentFile, TorrentLayout, TorrentMetadata};
