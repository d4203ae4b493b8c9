//! BitTorrent tracker communication.
//!
//! The announce URL's scheme selects the transport once: HTTP trackers get a
//! single bencoded GET, UDP trackers the BEP 15 connect, scrape and announce
//! exchange.

pub mod http;
pub mod manager;
pub mod protocol;
pub mod types;
pub mod udp;

pub use http::HttpTrackerClient;
pub use manager::TrackerSet;
pub use types::{
    AnnounceRequest, AnnounceResponse, Peer, PeerStatus, ScrapeStats, TrackerManagement,
};
pub use udp::{TrackerSession, UdpTrackerClient};

use url::Url;

use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

/// Tracker transport chosen from the announce URL scheme.
#[derive(Debug)]
pub enum TrackerTransport {
    Http(HttpTrackerClient),
    Udp(UdpTrackerClient),
}

impl TrackerTransport {
    /// Selects the transport for `announce_url`.
    ///
    /// # Errors
    /// - `TorrentError::UrlParsing` - URL does not parse
    /// - `TorrentError::UnsupportedTrackerScheme` - Scheme is not http, https or udp
    pub fn from_url(announce_url: &str, config: &NetworkConfig) -> Result<Self, TorrentError> {
        let url = Url::parse(announce_url)?;
        match url.scheme() {
            "http" | "https" => Ok(TrackerTransport::Http(HttpTrackerClient::new(
                announce_url.to_string(),
                config,
            )?)),
            "udp" => Ok(TrackerTransport::Udp(UdpTrackerClient::new(
                announce_url.to_string(),
                config,
            ))),
            scheme => Err(TorrentError::UnsupportedTrackerScheme {
                scheme: scheme.to_string(),
                url: announce_url.to_string(),
            }),
        }
    }

    /// Announces through the selected transport.
    ///
    /// # Errors
    /// - `TorrentError::TrackerTimeout` / `TrackerUnreachable` / `ProtocolError` -
    ///   Propagated from the transport
    pub async fn announce(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TorrentError> {
        match self {
            TrackerTransport::Http(client) => client.announce(request).await,
            TrackerTransport::Udp(client) => client.announce(request).await,
        }
    }

    pub fn announce_url(&self) -> &str {
        match self {
            TrackerTransport::Http(client) => client.announce_url(),
            TrackerTransport::Udp(client) => client.announce_url(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use axum::Router;
    use axum::extract::RawQuery;
    use axum::routing::get;
    use bytes::{Buf, BufMut};
    use proptest::prelude::*;
    use tokio::net::UdpSocket;

    use super::protocol::*;
    use super::*;
    use crate::config::HypertubeConfig;
    use crate::torrent::InfoHash;
    use crate::torrent::protocol::PeerId;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::new([0x12; 20]),
            peer_id: PeerId::new(*b"-HT0001-abcdefghijkl"),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            num_want: -1,
        }
    }

    #[test]
    fn test_compact_peers_decode() {
        let peers = parse_compact_peers(&[127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80]).unwrap();
        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:80".parse::<SocketAddr>().unwrap(),
            ]
        );
        assert!(parse_compact_peers(&[1, 2, 3, 4, 5]).is_err());
    }

    proptest! {
        #[test]
        fn prop_compact_peers_count(raw in prop::collection::vec(any::<u8>(), 0..120)) {
            let result = parse_compact_peers(&raw);
            if raw.len() % 6 == 0 {
                prop_assert_eq!(result.unwrap().len(), raw.len() / 6);
            } else {
                prop_assert!(result.is_err());
            }
        }
    }

    #[test]
    fn test_transport_selected_by_scheme() {
        let config = HypertubeConfig::default().network;

        assert!(matches!(
            TrackerTransport::from_url("http://tracker.example.com/announce", &config),
            Ok(TrackerTransport::Http(_))
        ));
        assert!(matches!(
            TrackerTransport::from_url("udp://tracker.example.com:1337", &config),
            Ok(TrackerTransport::Udp(_))
        ));
        match TrackerTransport::from_url("wss://tracker.example.com", &config) {
            Err(TorrentError::UnsupportedTrackerScheme { scheme, .. }) => assert_eq!(scheme, "wss"),
            other => panic!("expected unsupported scheme, got {other:?}"),
        }
    }

    #[test]
    fn test_http_announce_url_encoding() {
        let config = HypertubeConfig::default().network;
        let client =
            HttpTrackerClient::new("http://tracker.example.com/announce".to_string(), &config)
                .unwrap();

        let url = client.build_announce_url(&request());

        assert!(url.starts_with("http://tracker.example.com/announce?info_hash="));
        assert!(url.contains(&"%12".repeat(20)));
        assert!(url.contains("peer_id=-HT0001-abcdefghijkl"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("compact=1"));
        assert!(url.contains("left=1000"));
    }

    #[test]
    fn test_http_response_parsing() {
        let body = b"d8:completei3e10:incompletei1e8:intervali900e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let response = HttpTrackerClient::parse_announce_response("http://t", body).unwrap();

        assert_eq!(response.interval, Some(Duration::from_secs(900)));
        assert_eq!(response.seeders, Some(3));
        assert_eq!(response.leechers, Some(1));
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn test_http_failure_reason_is_unreachable() {
        let body = b"d14:failure reason17:torrent not founde";
        match HttpTrackerClient::parse_announce_response("http://t", body) {
            Err(TorrentError::TrackerUnreachable { reason, .. }) => {
                assert_eq!(reason, "torrent not found")
            }
            other => panic!("expected tracker failure, got {other:?}"),
        }
    }

    #[test]
    fn test_udp_packet_layouts() {
        let connect = connect_request(0xdead_beef);
        assert_eq!(connect.len(), 16);
        assert_eq!(&connect[..8], &0x41727101980u64.to_be_bytes());
        assert_eq!(&connect[8..12], &[0, 0, 0, 0]);
        assert_eq!(&connect[12..], &0xdead_beefu32.to_be_bytes());

        let announce = announce_request(7, 9, &request(), 42);
        assert_eq!(announce.len(), 98);
        assert_eq!(&announce[..8], &7u64.to_be_bytes());
        assert_eq!(&announce[8..12], &1u32.to_be_bytes());
        assert_eq!(&announce[16..36], &[0x12; 20]);
        assert_eq!(&announce[64..72], &1000u64.to_be_bytes());
        assert_eq!(&announce[92..96], &(-1i32).to_be_bytes());
        assert_eq!(&announce[96..], &6881u16.to_be_bytes());

        let scrape = scrape_request(7, 9, &InfoHash::new([0x12; 20]));
        assert_eq!(scrape.len(), 36);
    }

    #[test]
    fn test_udp_response_parsing() {
        let mut packet = Vec::new();
        packet.put_u32(ACTION_ANNOUNCE);
        packet.put_u32(9);
        packet.put_u32(1800);
        packet.put_u32(4);
        packet.put_u32(2);
        packet.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        let response = parse_announce_response(&packet).unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(1800)));
        assert_eq!(response.leechers, Some(4));
        assert_eq!(response.seeders, Some(2));
        assert_eq!(response.peers.len(), 1);

        let mut scrape = Vec::new();
        scrape.put_u32(ACTION_SCRAPE);
        scrape.put_u32(9);
        scrape.put_u32(10);
        scrape.put_u32(20);
        scrape.put_u32(30);
        assert_eq!(
            parse_scrape_response(&scrape).unwrap(),
            ScrapeStats {
                seeders: 10,
                completed: 20,
                leechers: 30
            }
        );
    }

    /// Answers connect with a stray response first, ignores scrape, then answers announce.
    async fn fake_udp_tracker() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let mut packet = &buf[..len];
                if len == 16 {
                    let _protocol_id = packet.get_u64();
                    let _action = packet.get_u32();
                    let transaction_id = packet.get_u32();

                    let mut stray = Vec::new();
                    stray.put_u32(ACTION_CONNECT);
                    stray.put_u32(transaction_id.wrapping_add(1));
                    stray.put_u64(1);
                    socket.send_to(&stray, from).await.unwrap();

                    let mut reply = Vec::new();
                    reply.put_u32(ACTION_CONNECT);
                    reply.put_u32(transaction_id);
                    reply.put_u64(0xabcd);
                    socket.send_to(&reply, from).await.unwrap();
                    continue;
                }

                let connection_id = packet.get_u64();
                let action = packet.get_u32();
                let transaction_id = packet.get_u32();
                assert_eq!(connection_id, 0xabcd);
                if action == ACTION_ANNOUNCE {
                    let mut reply = Vec::new();
                    reply.put_u32(ACTION_ANNOUNCE);
                    reply.put_u32(transaction_id);
                    reply.put_u32(120);
                    reply.put_u32(0);
                    reply.put_u32(1);
                    reply.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
                    socket.send_to(&reply, from).await.unwrap();
                }
            }
        });
        address
    }

    #[tokio::test]
    async fn test_udp_announce_discards_stray_transactions_and_survives_scrape_loss() {
        let address = fake_udp_tracker().await;
        let config = HypertubeConfig::for_testing().network;
        let mut client = UdpTrackerClient::new(format!("udp://{address}"), &config);

        let response = client.announce(&request()).await.unwrap();

        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
        assert_eq!(response.interval, Some(Duration::from_secs(120)));
        assert_eq!(client.session().connection_id, Some(0xabcd));
        assert_eq!(client.session().call_interval, Some(Duration::from_secs(120)));
        assert!(client.session().last_scrape.is_none());
    }

    #[tokio::test]
    async fn test_udp_connect_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = silent.local_addr().unwrap();
        let config = HypertubeConfig::for_testing().network;
        let mut client = UdpTrackerClient::new(format!("udp://{address}"), &config);

        match client.announce(&request()).await {
            Err(TorrentError::TrackerTimeout { stage, .. }) => assert_eq!(stage, "connect"),
            other => panic!("expected connect timeout, got {other:?}"),
        }
        drop(silent);
    }

    #[tokio::test]
    async fn test_tracker_set_falls_back_to_next_url() {
        let app = Router::new().route(
            "/announce",
            get(|RawQuery(query): RawQuery| async move {
                assert!(query.unwrap_or_default().contains("compact=1"));
                b"d8:intervali60e5:peers6:\x0a\x00\x00\x05\x00\x50e".to_vec()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let mut set = TrackerSet::new(
            vec![
                "wss://tracker.example.com/announce".to_string(),
                format!("http://{address}/announce"),
            ],
            HypertubeConfig::for_testing().network,
        );

        let response = set.announce(&request()).await.unwrap();
        assert_eq!(response.peers, vec!["10.0.0.5:80".parse().unwrap()]);
        assert_eq!(response.interval, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_tracker_set_reports_last_error() {
        let mut set = TrackerSet::new(
            vec!["ftp://tracker.example.com/announce".to_string()],
            HypertubeConfig::for_testing().network,
        );
        let result = set.announce(&request()).await;
        assert!(matches!(
            result,
            Err(TorrentError::UnsupportedTrackerScheme { .. })
        ));
    }
}
