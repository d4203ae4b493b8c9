//! HTTP tracker client

use std::time::Duration;

use serde::Deserialize;

use super::protocol::parse_compact_peers;
use super::types::{AnnounceRequest, AnnounceResponse};
use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

#[derive(Debug, Deserialize)]
struct HttpAnnounceBody {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    complete: Option<u32>,
    incomplete: Option<u32>,
    #[serde(default, with = "serde_bytes")]
    peers: Vec<u8>,
}

/// HTTP tracker client.
///
/// One GET per announce; transport and decode errors go back to the caller
/// without internal retries.
#[derive(Debug, Clone)]
pub struct HttpTrackerClient {
    announce_url: String,
    client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates an HTTP tracker client with the configured request timeout.
    ///
    /// # Errors
    /// - `TorrentError::Http` - HTTP client could not be built
    pub fn new(announce_url: String, config: &NetworkConfig) -> Result<Self, TorrentError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;

        Ok(Self {
            announce_url,
            client,
        })
    }

    pub fn announce_url(&self) -> &str {
        &self.announce_url
    }

    /// Builds the announce URL with the compact query.
    pub fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        let separator = if self.announce_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&compact=1&left={}",
            self.announce_url,
            separator,
            urlencoding::encode_binary(request.info_hash.as_bytes()),
            urlencoding::encode_binary(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        )
    }

    /// Announces to the tracker and decodes its peer list.
    ///
    /// # Errors
    /// - `TorrentError::TrackerTimeout` - No response within the timeout
    /// - `TorrentError::TrackerUnreachable` - Connection failure, error status
    ///   or a `failure reason` in the response
    /// - `TorrentError::ProtocolError` - Response is not a valid announce body
    pub async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TorrentError> {
        let url = self.build_announce_url(request);
        tracing::debug!("HTTP announce to {}", self.announce_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(TorrentError::TrackerUnreachable {
                url: self.announce_url.clone(),
                reason: format!("HTTP status {}", response.status()),
            });
        }

        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;
        Self::parse_announce_response(&self.announce_url, &body)
    }

    /// Decodes a bencoded announce response body.
    ///
    /// # Errors
    /// - `TorrentError::TrackerUnreachable` - Body carries a `failure reason`
    /// - `TorrentError::ProtocolError` - Malformed body or compact peer list
    pub fn parse_announce_response(
        url: &str,
        body: &[u8],
    ) -> Result<AnnounceResponse, TorrentError> {
        let parsed: HttpAnnounceBody =
            serde_bencode::from_bytes(body).map_err(|e| TorrentError::ProtocolError {
                message: format!("Failed to parse tracker response: {e}"),
            })?;

        if let Some(reason) = parsed.failure_reason {
            return Err(TorrentError::TrackerUnreachable {
                url: url.to_string(),
                reason,
            });
        }

        Ok(AnnounceResponse {
            interval: parsed
                .interval
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs),
            seeders: parsed.complete,
            leechers: parsed.incomplete,
            peers: parse_compact_peers(&parsed.peers)?,
        })
    }

    fn transport_error(&self, error: reqwest::Error) -> TorrentError {
        if error.is_timeout() {
            TorrentError::TrackerTimeout {
                url: self.announce_url.clone(),
                stage: "announce",
            }
        } else {
            TorrentError::TrackerUnreachable {
                url: self.announce_url.clone(),
                reason: error.to_string(),
            }
        }
    }
}
