//! Piece scheduler: work queue, per-connection workers and result collection
//!
//! Every missing piece sits on one shared queue. Each activated connection
//! gets a worker task that pops pieces, downloads them with pipelined block
//! requests, verifies the SHA-1 and publishes the result. A failing worker
//! pushes its piece back and exits, so a piece is either queued or claimed
//! by exactly one worker.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::parsing::TorrentMetadata;
use super::protocol::{PeerConnection, PeerMessage};
use super::{PieceIndex, TorrentError};
use crate::config::TorrentConfig;
use crate::storage::FileRecordStore;

/// One piece waiting to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    pub index: PieceIndex,
    pub hash: [u8; 20],
    pub length: u32,
}

/// State of one worker's attempt at one piece.
#[derive(Debug)]
pub struct PieceProgress {
    pub index: PieceIndex,
    pub buffer: Vec<u8>,
    pub downloaded: u32,
    pub requested: u32,
    /// Requests sent and not yet answered
    pub backlog: usize,
}

impl PieceProgress {
    pub fn new(work: &PieceWork) -> Self {
        Self {
            index: work.index,
            buffer: vec![0; work.length as usize],
            downloaded: 0,
            requested: 0,
            backlog: 0,
        }
    }

    /// Copies a received block into the buffer.
    ///
    /// Blocks of other pieces are ignored.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Block outside the piece or more data
    ///   than the piece holds
    pub fn receive_block(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<(), TorrentError> {
        if piece_index != self.index {
            return Ok(());
        }

        let start = offset as usize;
        let end = start + data.len();
        if end > self.buffer.len() {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "block [{start}, {end}) outside piece {} of {} bytes",
                    self.index,
                    self.buffer.len()
                ),
            });
        }
        let received = u32::try_from(data.len()).unwrap_or(u32::MAX);
        if self.downloaded as usize + data.len() > self.buffer.len() {
            return Err(TorrentError::ProtocolError {
                message: format!("piece {} received more bytes than it holds", self.index),
            });
        }

        self.buffer[start..end].copy_from_slice(data);
        self.downloaded += received;
        self.backlog = self.backlog.saturating_sub(1);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded as usize >= self.buffer.len()
    }
}

/// A downloaded piece whose hash matched.
#[derive(Debug, Clone)]
pub struct PieceResult {
    pub index: PieceIndex,
    pub buffer: Bytes,
}

/// A verified piece at its absolute position in the concatenated file stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPiece {
    pub start_byte: u64,
    pub length: u64,
    pub data: Bytes,
}

#[derive(Clone)]
struct WorkQueue {
    tx: async_channel::Sender<PieceWork>,
    rx: async_channel::Receiver<PieceWork>,
}

impl WorkQueue {
    fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    async fn requeue(&self, work: PieceWork) {
        if self.tx.send(work).await.is_err() {
            tracing::trace!("Work queue closed, dropping requeued piece");
        }
    }

    fn close(&self) {
        self.tx.close();
    }
}

/// Downloads the missing pieces of one file record.
pub struct PieceScheduler {
    file_id: String,
    metadata: Arc<TorrentMetadata>,
    store: Arc<dyn FileRecordStore>,
    loaded_tx: mpsc::Sender<LoadedPiece>,
    config: TorrentConfig,
}

impl PieceScheduler {
    pub fn new(
        file_id: impl Into<String>,
        metadata: Arc<TorrentMetadata>,
        store: Arc<dyn FileRecordStore>,
        loaded_tx: mpsc::Sender<LoadedPiece>,
        config: TorrentConfig,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            metadata,
            store,
            loaded_tx,
            config,
        }
    }

    /// Work items for every piece not yet recorded as loaded.
    pub async fn pending_work(&self) -> Result<Vec<PieceWork>, TorrentError> {
        let loaded: HashSet<u32> = self
            .store
            .loaded_indexes(&self.file_id)
            .await?
            .into_iter()
            .collect();

        Ok(self
            .metadata
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| (PieceIndex::new(i as u32), hash))
            .filter(|(index, _)| !loaded.contains(&index.as_u32()))
            .map(|(index, hash)| PieceWork {
                index,
                hash: *hash,
                length: self.metadata.piece_size(index),
            })
            .collect())
    }

    /// Runs workers on incoming connections until every missing piece is
    /// verified and saved.
    ///
    /// Cancellation closes the work queue and returns `Ok` immediately;
    /// workers exit once their current read completes.
    ///
    /// # Errors
    /// - `TorrentError::Storage` - Loaded indexes could not be read
    /// - `TorrentError::NoPeersAvailable` - Connection stream and all workers
    ///   ended with pieces still missing
    pub async fn download(
        &self,
        mut connections: mpsc::Receiver<PeerConnection>,
        cancel: CancellationToken,
    ) -> Result<(), TorrentError> {
        let pending = self.pending_work().await?;
        let total = pending.len();
        tracing::info!(
            "Starting download of {} pieces ({} already loaded), {} bytes, piece length {} for {}",
            total,
            self.metadata.piece_count() - total,
            self.metadata.total_length,
            self.metadata.piece_length,
            self.metadata.name
        );
        if total == 0 {
            return Ok(());
        }

        let queue = WorkQueue::with_capacity(total);
        for work in pending {
            queue.requeue(work).await;
        }

        let (results_tx, mut results_rx) = mpsc::channel(self.config.results_capacity.max(1));
        let intake_stop = cancel.child_token();
        let _intake_guard = intake_stop.clone().drop_guard();

        let intake_queue = queue.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            loop {
                let connection = tokio::select! {
                    _ = intake_stop.cancelled() => break,
                    connection = connections.recv() => match connection {
                        Some(connection) => connection,
                        None => break,
                    },
                };
                tracing::info!(peer = %connection.address(), "Starting worker");
                tokio::spawn(run_worker(
                    connection,
                    intake_queue.clone(),
                    results_tx.clone(),
                    config.clone(),
                ));
            }
        });

        let mut done = 0usize;
        while done < total {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Download of {} cancelled", self.metadata.name);
                    queue.close();
                    return Ok(());
                }
                result = results_rx.recv() => result,
            };

            let Some(result) = result else {
                queue.close();
                return Err(TorrentError::NoPeersAvailable {
                    missing: total - done,
                });
            };

            self.publish(result).await;
            done += 1;
            let percent = done as f64 / total as f64 * 100.0;
            tracing::info!("({:.2}%) Downloaded {} of {} pieces", percent, done, total);
        }

        queue.close();
        Ok(())
    }

    async fn publish(&self, result: PieceResult) {
        let (begin, end) = self.metadata.piece_bounds(result.index);
        let loaded = LoadedPiece {
            start_byte: begin,
            length: end - begin,
            data: result.buffer.clone(),
        };
        if self.loaded_tx.send(loaded).await.is_err() {
            tracing::warn!(piece = %result.index, "Reassembler stopped, piece not written");
        }

        if let Err(e) = self
            .store
            .save_file_part(
                &self.file_id,
                &result.buffer,
                begin,
                end - begin,
                result.index.as_u32(),
            )
            .await
        {
            tracing::error!(piece = %result.index, "Failed to save file part: {}", e);
        }
    }
}

async fn run_worker(
    mut connection: PeerConnection,
    queue: WorkQueue,
    results_tx: mpsc::Sender<PieceResult>,
    config: TorrentConfig,
) {
    let address = connection.address();
    // Consecutive pops of pieces the peer does not have
    let mut misses = 0usize;

    while let Ok(work) = queue.rx.recv().await {
        if !connection.bitfield.has_piece(work.index.as_usize()) {
            queue.requeue(work).await;
            misses += 1;
            if misses <= queue.rx.len() {
                continue;
            }
            misses = 0;
            if let Err(e) = connection
                .await_state_change(config.idle_peer_wait, config.piece_read_timeout)
                .await
            {
                tracing::debug!(peer = %address, "Idle peer dropped: {}", e);
                break;
            }
            continue;
        }
        misses = 0;

        let buffer = match attempt_download(&mut connection, &work, &config).await {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(peer = %address, piece = %work.index, "Piece attempt failed: {}", e);
                queue.requeue(work).await;
                break;
            }
        };

        if !hash_matches(&work, &buffer) {
            let error = TorrentError::IntegrityFailure { index: work.index };
            tracing::warn!(peer = %address, "{}", error);
            queue.requeue(work).await;
            continue;
        }

        if let Err(e) = connection.send_have(work.index).await {
            tracing::debug!(peer = %address, "Failed to announce have: {}", e);
        }
        let result = PieceResult {
            index: work.index,
            buffer: Bytes::from(buffer),
        };
        if results_tx.send(result).await.is_err() {
            break;
        }
    }

    tracing::debug!(peer = %address, "Worker exiting");
    connection.close().await;
}

/// Downloads one piece over `connection`, pipelining block requests.
///
/// # Errors
/// - `TorrentError::StalledPeer` - No message within the piece read timeout
/// - `TorrentError::PeerConnectionError` - Socket failure
/// - `TorrentError::ProtocolError` - Malformed frame or out-of-range block
pub async fn attempt_download(
    connection: &mut PeerConnection,
    work: &PieceWork,
    config: &TorrentConfig,
) -> Result<Vec<u8>, TorrentError> {
    let mut progress = PieceProgress::new(work);

    while !progress.is_complete() {
        if !connection.choked {
            while progress.backlog < config.max_backlog && progress.requested < work.length {
                let block = config.max_block_size.min(work.length - progress.requested);
                connection
                    .send_request(work.index, progress.requested, block)
                    .await?;
                progress.backlog += 1;
                progress.requested += block;
            }
        }

        let message = match timeout(config.piece_read_timeout, connection.read_message()).await {
            Ok(message) => message?,
            Err(_) => {
                return Err(TorrentError::StalledPeer {
                    address: connection.address(),
                });
            }
        };

        match message {
            Some(PeerMessage::Piece {
                piece_index,
                offset,
                data,
            }) => progress.receive_block(piece_index, offset, &data)?,
            Some(other) => {
                connection.apply(&other);
            }
            None => {}
        }
    }

    Ok(progress.buffer)
}

fn hash_matches(work: &PieceWork, buffer: &[u8]) -> bool {
    let digest: [u8; 20] = Sha1::digest(buffer).into();
    digest == work.hash
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::HypertubeConfig;
    use crate::storage::InMemoryRecordStore;
    use crate::torrent::parsing::BencodeTorrentParser;
    use crate::torrent::test_fixtures::{
        SeederBehavior, TorrentFixture, TorrentFixtureBuilder, pattern_content, spawn_seeder,
    };
    use crate::torrent::PeerId;

    fn work(length: u32) -> PieceWork {
        PieceWork {
            index: PieceIndex::new(3),
            hash: [0; 20],
            length,
        }
    }

    #[test]
    fn test_progress_copies_blocks_by_offset() {
        let mut progress = PieceProgress::new(&work(8));
        progress.backlog = 2;
        progress.receive_block(PieceIndex::new(3), 4, b"5678").unwrap();
        progress.receive_block(PieceIndex::new(3), 0, b"1234").unwrap();
        assert!(progress.is_complete());
        assert_eq!(progress.buffer, b"12345678");
        assert_eq!(progress.backlog, 0);
    }

    #[test]
    fn test_progress_ignores_other_pieces() {
        let mut progress = PieceProgress::new(&work(8));
        progress.receive_block(PieceIndex::new(4), 0, b"1234").unwrap();
        assert_eq!(progress.downloaded, 0);
    }

    #[test]
    fn test_progress_rejects_out_of_range_and_excess_blocks() {
        let mut progress = PieceProgress::new(&work(8));
        assert!(progress.receive_block(PieceIndex::new(3), 6, b"1234").is_err());

        progress.receive_block(PieceIndex::new(3), 0, b"12345678").unwrap();
        assert!(progress.receive_block(PieceIndex::new(3), 0, b"1").is_err());
        assert!(progress.downloaded <= 8);
    }

    struct Setup {
        fixture: TorrentFixture,
        metadata: Arc<TorrentMetadata>,
        store: Arc<InMemoryRecordStore>,
        config: HypertubeConfig,
    }

    async fn setup(content_len: usize, piece_length: u32) -> Setup {
        let fixture = TorrentFixtureBuilder::new("movie.mkv")
            .piece_length(piece_length)
            .build_single(pattern_content(content_len));
        let metadata = BencodeTorrentParser::new()
            .parse_torrent_data(&fixture.bytes)
            .unwrap();
        let store = Arc::new(InMemoryRecordStore::new());
        store.insert_torrent("1", fixture.bytes.clone()).await;
        Setup {
            fixture,
            metadata: Arc::new(metadata),
            store,
            config: HypertubeConfig::for_testing(),
        }
    }

    async fn connect(setup: &Setup, seeder: std::net::SocketAddr) -> PeerConnection {
        let mut connection = PeerConnection::connect(
            seeder,
            setup.fixture.info_hash,
            PeerId::generate("-HT0001-"),
            setup.metadata.piece_count(),
            &setup.config.network,
        )
        .await
        .unwrap();
        connection.send_interested().await.unwrap();
        connection
    }

    fn scheduler(setup: &Setup) -> (PieceScheduler, mpsc::Receiver<LoadedPiece>) {
        let (loaded_tx, loaded_rx) = mpsc::channel(64);
        let scheduler = PieceScheduler::new(
            "1",
            setup.metadata.clone(),
            setup.store.clone(),
            loaded_tx,
            setup.config.torrent.clone(),
        );
        (scheduler, loaded_rx)
    }

    #[tokio::test]
    async fn test_corrupt_peer_pieces_are_requeued() {
        let setup = setup(40_000, 16384).await;
        let all: Vec<usize> = (0..setup.fixture.piece_count()).collect();
        let corrupt = spawn_seeder(setup.fixture.clone(), all.clone(), SeederBehavior::Corrupt).await;
        let honest = spawn_seeder(setup.fixture.clone(), all, SeederBehavior::Honest).await;

        let (connections_tx, connections_rx) = mpsc::channel(4);
        connections_tx.send(connect(&setup, corrupt.address).await).await.unwrap();
        connections_tx.send(connect(&setup, honest.address).await).await.unwrap();

        let (scheduler, mut loaded_rx) = scheduler(&setup);
        scheduler
            .download(connections_rx, CancellationToken::new())
            .await
            .unwrap();

        let mut parts = setup.store.saved_parts("1").await;
        parts.sort_by_key(|part| part.offset);
        assert_eq!(parts.len(), 3);
        let saved: Vec<u8> = parts.into_iter().flat_map(|part| part.data).collect();
        assert_eq!(saved, pattern_content(40_000));

        let mut loaded = 0;
        while let Ok(piece) = loaded_rx.try_recv() {
            assert_eq!(piece.length, piece.data.len() as u64);
            loaded += 1;
        }
        assert_eq!(loaded, 3);
    }

    #[tokio::test]
    async fn test_loaded_pieces_are_skipped() {
        let setup = setup(40_000, 16384).await;
        let first = setup.fixture.piece(0).to_vec();
        setup
            .store
            .save_file_part("1", &first, 0, first.len() as u64, 0)
            .await
            .unwrap();

        let pending = scheduler(&setup).0.pending_work().await.unwrap();
        let indexes: Vec<u32> = pending.iter().map(|work| work.index.as_u32()).collect();
        assert_eq!(indexes, vec![1, 2]);
        assert_eq!(pending[1].length, 40_000 - 2 * 16384);

        let seeder = spawn_seeder(setup.fixture.clone(), vec![1, 2], SeederBehavior::Honest).await;
        let (connections_tx, connections_rx) = mpsc::channel(1);
        connections_tx.send(connect(&setup, seeder.address).await).await.unwrap();

        let (scheduler, _loaded_rx) = scheduler(&setup);
        scheduler
            .download(connections_rx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(setup.store.saved_parts("1").await.len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_returns_without_blocking() {
        let setup = setup(40_000, 16384).await;
        let seeder = spawn_seeder(setup.fixture.clone(), vec![0, 1, 2], SeederBehavior::Choking).await;
        let (connections_tx, connections_rx) = mpsc::channel(1);
        connections_tx.send(connect(&setup, seeder.address).await).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let (scheduler, _loaded_rx) = scheduler(&setup);
        let result = timeout(
            Duration::from_secs(2),
            scheduler.download(connections_rx, cancel),
        )
        .await
        .expect("download did not observe cancellation");
        assert!(result.is_ok());
        assert!(setup.store.saved_parts("1").await.is_empty());
    }

    #[tokio::test]
    async fn test_pieces_split_across_peers() {
        let setup = setup(40_000, 16384).await;
        let (connections_tx, connections_rx) = mpsc::channel(3);
        let mut seeders = Vec::new();
        for piece in 0..3 {
            let seeder = spawn_seeder(setup.fixture.clone(), vec![piece], SeederBehavior::Honest).await;
            connections_tx.send(connect(&setup, seeder.address).await).await.unwrap();
            seeders.push(seeder);
        }

        let (scheduler, _loaded_rx) = scheduler(&setup);
        scheduler
            .download(connections_rx, CancellationToken::new())
            .await
            .unwrap();

        for seeder in &seeders {
            assert!(seeder.stats.blocks_served.load(std::sync::atomic::Ordering::SeqCst) >= 1);
        }
        let mut indexes = setup.store.loaded_indexes("1").await.unwrap();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_stalled_peer_exhausts_connections() {
        let mut setup = setup(20_000, 16384).await;
        setup.config.torrent.piece_read_timeout = Duration::from_millis(200);
        let seeder = spawn_seeder(setup.fixture.clone(), vec![0, 1], SeederBehavior::Stall).await;

        let (connections_tx, connections_rx) = mpsc::channel(1);
        connections_tx.send(connect(&setup, seeder.address).await).await.unwrap();
        drop(connections_tx);

        let (scheduler, _loaded_rx) = scheduler(&setup);
        let result = timeout(
            Duration::from_secs(3),
            scheduler.download(connections_rx, CancellationToken::new()),
        )
        .await
        .expect("stalled peer was not abandoned");
        assert!(matches!(
            result,
            Err(TorrentError::NoPeersAvailable { missing: 2 })
        ));
    }
}
