//! Tracker failover across the primary and alternate announce URLs

use async_trait::async_trait;

use super::types::{AnnounceRequest, AnnounceResponse, TrackerManagement};
use super::TrackerTransport;
use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

/// Ordered set of trackers for one torrent.
///
/// Announces go to each URL in order until one answers. Transports are built
/// lazily and kept, so UDP session state survives between refreshes.
pub struct TrackerSet {
    urls: Vec<String>,
    transports: Vec<Option<TrackerTransport>>,
    network_config: NetworkConfig,
}

impl TrackerSet {
    pub fn new(urls: Vec<String>, network_config: NetworkConfig) -> Self {
        let transports = urls.iter().map(|_| None).collect();
        Self {
            urls,
            transports,
            network_config,
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }
}

#[async_trait]
impl TrackerManagement for TrackerSet {
    async fn announce(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TorrentError> {
        let mut last_error = None;

        for (url, slot) in self.urls.iter().zip(self.transports.iter_mut()) {
            if slot.is_none() {
                match TrackerTransport::from_url(url, &self.network_config) {
                    Ok(transport) => *slot = Some(transport),
                    Err(e) => {
                        tracing::warn!("Skipping tracker {}: {}", url, e);
                        last_error = Some(e);
                        continue;
                    }
                }
            }
            let Some(transport) = slot.as_mut() else {
                continue;
            };

            tracing::info!("Announcing {} to {}", request.info_hash, url);
            match transport.announce(request).await {
                Ok(response) => {
                    tracing::info!(
                        "Tracker {} returned {} peers (interval {:?})",
                        url,
                        response.peers.len(),
                        response.interval
                    );
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!("Tracker {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TorrentError::TrackerUnreachable {
            url: String::new(),
            reason: "no tracker URLs".to_string(),
        }))
    }
}
