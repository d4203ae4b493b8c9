//! UDP tracker client (BEP 15)
//!
//! One call runs connect, a best-effort scrape and announce over a single
//! socket. A pump task owns the socket and talks to the client through a
//! send/receive channel pair; dropping the pump signals it to exit.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::protocol::{
    ACTION_ANNOUNCE, ACTION_CONNECT, ACTION_ERROR, ACTION_SCRAPE, UdpResponseHeader,
    announce_request, connect_request, parse_announce_response, parse_connect_response,
    parse_error_message, parse_scrape_response, scrape_request,
};
use super::types::{AnnounceRequest, AnnounceResponse, ScrapeStats};
use crate::config::NetworkConfig;
use crate::torrent::{InfoHash, TorrentError};

const MAX_DATAGRAM_LEN: usize = 2048;

/// State carried between round trips with one UDP tracker.
#[derive(Debug, Clone, Default)]
pub struct TrackerSession {
    /// Id of the exchange in flight; responses must echo it
    pub transaction_id: u32,
    /// Valid until the next connect
    pub connection_id: Option<u64>,
    /// Last interval the tracker reported
    pub call_interval: Option<Duration>,
    /// Last scrape statistics, when the scrape succeeded
    pub last_scrape: Option<ScrapeStats>,
}

/// Socket pump bound to one tracker for the duration of a call.
struct SocketPump {
    send_tx: mpsc::Sender<Vec<u8>>,
    recv_rx: mpsc::Receiver<Vec<u8>>,
    exit: CancellationToken,
}

impl SocketPump {
    fn start(socket: UdpSocket) -> Self {
        let (send_tx, mut send_rx) = mpsc::channel::<Vec<u8>>(8);
        let (recv_tx, recv_rx) = mpsc::channel::<Vec<u8>>(8);
        let exit = CancellationToken::new();
        let exit_signal = exit.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            loop {
                tokio::select! {
                    _ = exit_signal.cancelled() => break,
                    outgoing = send_rx.recv() => {
                        let Some(packet) = outgoing else { break };
                        if let Err(e) = socket.send(&packet).await {
                            tracing::warn!("UDP tracker send failed: {}", e);
                        }
                    }
                    received = socket.recv(&mut buf) => match received {
                        Ok(len) => {
                            if recv_tx.send(buf[..len].to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::debug!("UDP tracker receive failed: {}", e),
                    },
                }
            }
        });

        Self {
            send_tx,
            recv_rx,
            exit,
        }
    }
}

impl Drop for SocketPump {
    fn drop(&mut self) {
        self.exit.cancel();
    }
}

/// UDP tracker client.
#[derive(Debug)]
pub struct UdpTrackerClient {
    announce_url: String,
    config: NetworkConfig,
    session: TrackerSession,
}

impl UdpTrackerClient {
    pub fn new(announce_url: String, config: &NetworkConfig) -> Self {
        Self {
            announce_url,
            config: config.clone(),
            session: TrackerSession::default(),
        }
    }

    pub fn announce_url(&self) -> &str {
        &self.announce_url
    }

    pub fn session(&self) -> &TrackerSession {
        &self.session
    }

    /// Runs connect, scrape and announce against the tracker.
    ///
    /// # Errors
    /// - `TorrentError::TrackerTimeout` - Connect or announce timed out
    /// - `TorrentError::TrackerUnreachable` - Address resolution, socket
    ///   failure or an error response
    /// - `TorrentError::ProtocolError` - Malformed response
    pub async fn announce(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TorrentError> {
        let address = self.resolve().await?;
        let bind_addr = if address.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| self.unreachable(e.to_string()))?;
        socket
            .connect(address)
            .await
            .map_err(|e| self.unreachable(e.to_string()))?;

        let mut pump = SocketPump::start(socket);

        let connection_id = self.connect(&mut pump).await?;

        match self.scrape(&mut pump, connection_id, &request.info_hash).await {
            Ok(stats) => {
                tracing::debug!(
                    "Tracker {} scrape: {} seeders, {} leechers, {} completed",
                    self.announce_url,
                    stats.seeders,
                    stats.leechers,
                    stats.completed
                );
                self.session.last_scrape = Some(stats);
            }
            Err(e) => tracing::warn!("Tracker {} scrape failed: {}", self.announce_url, e),
        }

        let transaction_id = self.next_transaction();
        let packet = announce_request(connection_id, transaction_id, request, rand::random());
        let response = self
            .exchange(
                &mut pump,
                packet,
                ACTION_ANNOUNCE,
                self.config.udp_announce_timeout,
                "announce",
            )
            .await?;
        let announce = parse_announce_response(&response)?;
        self.session.call_interval = announce.interval;

        Ok(announce)
    }

    async fn connect(&mut self, pump: &mut SocketPump) -> Result<u64, TorrentError> {
        self.session.connection_id = None;
        let transaction_id = self.next_transaction();
        let response = self
            .exchange(
                pump,
                connect_request(transaction_id),
                ACTION_CONNECT,
                self.config.udp_connect_timeout,
                "connect",
            )
            .await?;
        let connection_id = parse_connect_response(&response)?;
        self.session.connection_id = Some(connection_id);
        Ok(connection_id)
    }

    async fn scrape(
        &mut self,
        pump: &mut SocketPump,
        connection_id: u64,
        info_hash: &InfoHash,
    ) -> Result<ScrapeStats, TorrentError> {
        let transaction_id = self.next_transaction();
        let response = self
            .exchange(
                pump,
                scrape_request(connection_id, transaction_id, info_hash),
                ACTION_SCRAPE,
                self.config.udp_scrape_timeout,
                "scrape",
            )
            .await?;
        parse_scrape_response(&response)
    }

    /// Sends one packet and waits for the response echoing the transaction id.
    ///
    /// Responses for other transactions are discarded until the deadline.
    async fn exchange(
        &self,
        pump: &mut SocketPump,
        packet: Vec<u8>,
        expected_action: u32,
        limit: Duration,
        stage: &'static str,
    ) -> Result<Vec<u8>, TorrentError> {
        let deadline = Instant::now() + limit;
        pump.send_tx
            .send(packet)
            .await
            .map_err(|_| self.unreachable("socket pump stopped".to_string()))?;

        loop {
            let response = match timeout_at(deadline, pump.recv_rx.recv()).await {
                Ok(Some(response)) => response,
                Ok(None) => return Err(self.unreachable("socket pump stopped".to_string())),
                Err(_) => {
                    return Err(TorrentError::TrackerTimeout {
                        url: self.announce_url.clone(),
                        stage,
                    });
                }
            };

            let header = match UdpResponseHeader::parse(&response) {
                Ok(header) => header,
                Err(e) => {
                    tracing::warn!("Tracker {} sent bad {} response: {}", self.announce_url, stage, e);
                    continue;
                }
            };

            if header.transaction_id != self.session.transaction_id {
                tracing::warn!(
                    "Tracker {} {} response has transaction id {}, expected {}; discarding",
                    self.announce_url,
                    stage,
                    header.transaction_id,
                    self.session.transaction_id
                );
                continue;
            }

            if header.action == ACTION_ERROR {
                return Err(self.unreachable(parse_error_message(&response)));
            }
            if header.action != expected_action {
                return Err(TorrentError::ProtocolError {
                    message: format!(
                        "Tracker {} answered {} with action {}",
                        self.announce_url, stage, header.action
                    ),
                });
            }

            return Ok(response);
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, TorrentError> {
        let url = Url::parse(&self.announce_url)?;
        let host = url
            .host_str()
            .ok_or_else(|| self.unreachable("missing host".to_string()))?;
        let port = url
            .port()
            .ok_or_else(|| self.unreachable("missing port".to_string()))?;

        tokio::net::lookup_host((host.trim_matches(['[', ']']), port))
            .await
            .map_err(|e| self.unreachable(e.to_string()))?
            .next()
            .ok_or_else(|| self.unreachable(format!("no address for {host}")))
    }

    fn next_transaction(&mut self) -> u32 {
        self.session.transaction_id = rand::random();
        self.session.transaction_id
    }

    fn unreachable(&self, reason: String) -> TorrentError {
        TorrentError::TrackerUnreachable {
            url: self.announce_url.clone(),
            reason,
        }
    }
}
