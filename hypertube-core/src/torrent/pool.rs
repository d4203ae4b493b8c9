//! Peer pool: turns tracker peer lists into activated connections
//!
//! The pool task owns the peer set. Each known peer is activated by its own
//! task (dial, handshake, first message, unchoke and interested) and the
//! result is reported back to the pool loop, so no lock guards the set.
//! Activated connections are moved onto a bounded channel; ownership never
//! returns to the pool.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::protocol::{PeerConnection, PeerId};
use super::tracker::{AnnounceRequest, Peer, PeerStatus, TrackerManagement};
use super::{InfoHash, TorrentError};
use crate::config::HypertubeConfig;

// Activation tasks report the peer they dialled and the outcome
type Activations = JoinSet<(SocketAddr, Result<(), TorrentError>)>;

/// Identity announced to trackers and peers for one download.
#[derive(Debug, Clone)]
pub struct PoolIdentity {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    /// Bytes still to download, reported to trackers
    pub left: u64,
    /// Width of every peer's bitfield
    pub piece_count: usize,
}

/// Maintains the peer set of one torrent and activates connections.
pub struct PeerPool<T: TrackerManagement> {
    tracker: T,
    identity: PoolIdentity,
    config: HypertubeConfig,
    peers: Vec<Peer>,
    activated_tx: mpsc::Sender<PeerConnection>,
    snapshot_tx: watch::Sender<Vec<Peer>>,
}

/// Running pool task with its peer-set diagnostics.
pub struct PeerPoolHandle {
    snapshot_rx: watch::Receiver<Vec<Peer>>,
    task: JoinHandle<Vec<Peer>>,
}

impl PeerPoolHandle {
    /// Current peer set with statuses.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.snapshot_rx.borrow().clone()
    }

    /// Waits for the pool task to stop and returns the final peer set.
    pub async fn join(self) -> Vec<Peer> {
        let snapshot = self.snapshot_rx.borrow().clone();
        self.task.await.unwrap_or(snapshot)
    }
}

impl<T: TrackerManagement + 'static> PeerPool<T> {
    pub fn new(
        tracker: T,
        identity: PoolIdentity,
        config: HypertubeConfig,
    ) -> (Self, mpsc::Receiver<PeerConnection>) {
        let (activated_tx, activated_rx) =
            mpsc::channel(config.network.activated_connections_capacity.max(1));
        let (snapshot_tx, _) = watch::channel(Vec::new());
        (
            Self {
                tracker,
                identity,
                config,
                peers: Vec::new(),
                activated_tx,
                snapshot_tx,
            },
            activated_rx,
        )
    }

    /// Spawns the pool loop until `cancel` fires.
    ///
    /// Returns the handle and the activated connection stream, which closes
    /// when the pool stops.
    pub fn spawn(
        tracker: T,
        identity: PoolIdentity,
        config: HypertubeConfig,
        cancel: CancellationToken,
    ) -> (PeerPoolHandle, mpsc::Receiver<PeerConnection>) {
        let (pool, connections) = Self::new(tracker, identity, config);
        let snapshot_rx = pool.snapshot_tx.subscribe();
        let task = tokio::spawn(pool.run(cancel));
        (PeerPoolHandle { snapshot_rx, task }, connections)
    }

    /// Refreshes from the tracker on its interval and activates new peers.
    ///
    /// On cancellation pending activations are aborted and the activated
    /// connections channel closes. Returns the final peer set.
    pub async fn run(mut self, cancel: CancellationToken) -> Vec<Peer> {
        let mut activations: Activations = JoinSet::new();

        loop {
            let wait = tokio::select! {
                _ = cancel.cancelled() => return self.stop(activations),
                wait = self.refresh(&mut activations) => wait,
            };
            let next_refresh = tokio::time::sleep(wait);
            tokio::pin!(next_refresh);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return self.stop(activations),
                    _ = &mut next_refresh => break,
                    Some(joined) = activations.join_next() => match joined {
                        Ok((address, result)) => self.record_activation(address, result),
                        Err(e) if e.is_panic() => tracing::error!("Peer activation panicked: {}", e),
                        Err(_) => {}
                    },
                }
            }
        }
    }

    fn stop(self, mut activations: Activations) -> Vec<Peer> {
        tracing::debug!("Peer pool for {} stopping", self.identity.info_hash);
        activations.abort_all();
        self.peers
    }

    /// Announces, merges new peers and starts activations; returns the wait
    /// before the next refresh.
    async fn refresh(
        &mut self,
        activations: &mut Activations,
    ) -> Duration {
        let request = AnnounceRequest {
            info_hash: self.identity.info_hash,
            peer_id: self.identity.peer_id,
            port: self.identity.port,
            uploaded: 0,
            downloaded: 0,
            left: self.identity.left,
            num_want: self.config.network.desired_peers,
        };

        let interval = match self.tracker.announce(&request).await {
            Ok(response) => {
                let added = self.merge(&response.peers);
                tracing::info!(
                    "Tracker refresh for {}: {} peers reported, {} new",
                    self.identity.info_hash,
                    response.peers.len(),
                    added
                );
                response
                    .interval
                    .unwrap_or(self.config.network.default_refresh_interval)
            }
            Err(e) => {
                tracing::warn!("Tracker refresh for {} failed: {}", self.identity.info_hash, e);
                self.config.network.min_refresh_interval
            }
        };

        self.activate_known(activations);
        self.publish();
        interval.max(self.config.network.min_refresh_interval)
    }

    /// Adds peers not already in the set; returns how many were new.
    pub fn merge(&mut self, addresses: &[SocketAddr]) -> usize {
        let mut added = 0;
        for address in addresses {
            if !self.peers.iter().any(|peer| peer.address == *address) {
                self.peers.push(Peer::new(*address));
                added += 1;
            }
        }
        added
    }

    fn activate_known(
        &mut self,
        activations: &mut Activations,
    ) {
        for peer in self.peers.iter_mut().filter(|peer| peer.status == PeerStatus::Known) {
            peer.status = PeerStatus::Connecting;

            let address = peer.address;
            let info_hash = self.identity.info_hash;
            let peer_id = self.identity.peer_id;
            let piece_count = self.identity.piece_count;
            let network = self.config.network.clone();
            let activated_tx = self.activated_tx.clone();

            activations.spawn(async move {
                let result = async {
                    let mut connection =
                        PeerConnection::connect(address, info_hash, peer_id, piece_count, &network)
                            .await?;
                    connection.send_unchoke().await?;
                    connection.send_interested().await?;
                    activated_tx.send(connection).await.map_err(|_| {
                        TorrentError::PeerConnectionError {
                            address,
                            reason: "scheduler stopped accepting connections".to_string(),
                        }
                    })
                }
                .await;
                (address, result)
            });
        }
    }

    fn record_activation(&mut self, address: SocketAddr, result: Result<(), TorrentError>) {
        let status = match &result {
            Ok(()) => {
                tracing::info!(peer = %address, "Peer activated");
                PeerStatus::Activated
            }
            Err(e) => {
                tracing::debug!(peer = %address, "Peer marked dead: {}", e);
                PeerStatus::Dead
            }
        };
        if let Some(peer) = self.peers.iter_mut().find(|peer| peer.address == address) {
            peer.status = status;
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.peers.clone());
    }

    /// Current peer set.
    pub fn snapshot(&self) -> &[Peer] {
        &self.peers
    }
}
