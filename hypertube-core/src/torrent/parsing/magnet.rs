//! Magnet link helpers and the magnet-to-torrent resolver seam

use async_trait::async_trait;
use url::Url;

use crate::torrent::TorrentError;

/// Converts a magnet link into `.torrent` bytes.
///
/// Resolution needs metadata exchange with the swarm, which lives outside
/// this crate; the web layer receives an implementation at startup.
#[async_trait]
pub trait MagnetResolver: Send + Sync {
    /// Fetches the torrent file described by `magnet_link`.
    ///
    /// # Errors
    /// - `TorrentError::MagnetResolution` - The link could not be resolved
    async fn convert_magnet_to_torrent(&self, magnet_link: &str) -> Result<Vec<u8>, TorrentError>;
}

/// Resolver used when no magnet conversion service is configured.
#[derive(Debug, Default)]
pub struct UnconfiguredMagnetResolver;

#[async_trait]
impl MagnetResolver for UnconfiguredMagnetResolver {
    async fn convert_magnet_to_torrent(&self, magnet_link: &str) -> Result<Vec<u8>, TorrentError> {
        Err(TorrentError::MagnetResolution {
            reason: format!("no magnet resolver configured for {magnet_link}"),
        })
    }
}

/// Returns true when `source` looks like a magnet URI.
pub fn is_magnet_link(source: &[u8]) -> bool {
    source.starts_with(b"magnet:?")
}

/// Extracts the tracker URLs carried in a magnet link's `tr` parameters.
///
/// # Errors
/// - `TorrentError::MagnetResolution` - The link is not a magnet URI
/// - `TorrentError::UrlParsing` - The link is not a valid URI
pub fn trackers_from_magnet(magnet_link: &str) -> Result<Vec<String>, TorrentError> {
    let url = Url::parse(magnet_link)?;
    if url.scheme() != "magnet" {
        return Err(TorrentError::MagnetResolution {
            reason: format!("not a magnet link: {magnet_link}"),
        });
    }

    Ok(url
        .query_pairs()
        .filter(|(key, _)| key == "tr")
        .map(|(_, value)| value.into_owned())
        .collect())
}
