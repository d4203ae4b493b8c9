//! Download session: wires tracker, pool, scheduler and reassembler together
//! for one file record

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::parsing::{BencodeTorrentParser, MagnetResolver, TorrentMetadata, trackers_from_magnet};
use super::pool::{PeerPool, PoolIdentity};
use super::protocol::PeerId;
use super::reassembly::Reassembler;
use super::scheduler::{LoadedPiece, PieceScheduler};
use super::tracker::TrackerSet;
use super::{PieceIndex, TorrentError};
use crate::config::HypertubeConfig;
use crate::storage::{FileRecordStore, FileWriter, TorrentSource, WriteTask};

/// Resolves a record's torrent source into parsed metadata.
///
/// Magnet links go through `resolver` and their first `tr` tracker replaces
/// the announce URL of the converted torrent.
///
/// # Errors
/// - `TorrentError::Storage` - Unknown record
/// - `TorrentError::MagnetResolution` - Magnet conversion failed
/// - `TorrentError::MalformedMetadata` - Torrent bytes failed to decode
pub async fn load_metadata(
    store: &dyn FileRecordStore,
    resolver: &dyn MagnetResolver,
    file_id: &str,
) -> Result<TorrentMetadata, TorrentError> {
    let parser = BencodeTorrentParser::new();
    match store.torrent_source(file_id).await? {
        TorrentSource::TorrentFile(bytes) => parser.parse_torrent_data(&bytes),
        TorrentSource::Magnet(magnet_link) => {
            let bytes = resolver.convert_magnet_to_torrent(&magnet_link).await?;
            tracing::info!("Converted magnet link of {} into {} bytes", file_id, bytes.len());

            let mut metadata = parser.parse_torrent_data(&bytes)?;
            if let Some(tracker) = trackers_from_magnet(&magnet_link)?.into_iter().next() {
                tracing::info!("Tracker url from magnet: {}", tracker);
                metadata.announce = tracker;
            }
            Ok(metadata)
        }
    }
}

/// One download of one file record.
pub struct DownloadSession {
    file_id: String,
    metadata: Arc<TorrentMetadata>,
    config: HypertubeConfig,
    store: Arc<dyn FileRecordStore>,
    writer: Arc<dyn FileWriter>,
    write_tx: mpsc::Sender<WriteTask>,
}

impl DownloadSession {
    /// Creates a session writing through `write_tx`, the queue drained by
    /// the file writer task.
    pub fn new(
        file_id: impl Into<String>,
        metadata: TorrentMetadata,
        config: HypertubeConfig,
        store: Arc<dyn FileRecordStore>,
        writer: Arc<dyn FileWriter>,
        write_tx: mpsc::Sender<WriteTask>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            metadata: Arc::new(metadata),
            config,
            store,
            writer,
            write_tx,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn metadata(&self) -> &TorrentMetadata {
        &self.metadata
    }

    /// Creates the streamed file empty and records its name and length.
    ///
    /// The streamed file is the heaviest file of the torrent.
    ///
    /// # Errors
    /// - `TorrentError::MalformedMetadata` - Torrent lists no files
    /// - `TorrentError::Storage` - File creation or record update failed
    pub async fn prepare_file(&self) -> Result<(String, u64), TorrentError> {
        let file = self
            .metadata
            .heaviest_file()
            .ok_or_else(|| TorrentError::MalformedMetadata {
                reason: "torrent lists no files".to_string(),
            })?;
        let file_name = file.encoded_file_name();

        self.writer.create_empty_file(&file_name).await?;
        self.store.set_file_name(&self.file_id, &file_name).await?;
        self.store.set_file_length(&self.file_id, file.length).await?;

        tracing::info!(
            "Prepared file {} ({} bytes) for {} from {}",
            file_name,
            file.length,
            self.file_id,
            file.display_path()
        );
        Ok((file_name, file.length))
    }

    /// Downloads every missing piece and routes it onto disk.
    ///
    /// The peer pool and reassembler live for the duration of the call and
    /// are stopped when it returns.
    ///
    /// # Errors
    /// - `TorrentError::Storage` - Resume state could not be read
    /// - `TorrentError::NoPeersAvailable` - All peers were exhausted
    pub async fn download_to_file(&self, cancel: CancellationToken) -> Result<(), TorrentError> {
        let download_cancel = cancel.child_token();
        let _download_guard = download_cancel.clone().drop_guard();

        let identity = PoolIdentity {
            info_hash: self.metadata.info_hash,
            peer_id: PeerId::generate(self.config.torrent.client_prefix),
            port: self.config.torrent.peer_port,
            left: self.remaining_bytes().await?,
            piece_count: self.metadata.piece_count(),
        };
        let tracker = TrackerSet::new(self.metadata.tracker_urls(), self.config.network.clone());
        let (pool, connections) =
            PeerPool::spawn(tracker, identity, self.config.clone(), download_cancel.clone());

        let (loaded_tx, loaded_rx) = mpsc::channel(self.config.torrent.results_capacity.max(1));
        let reassembler = Reassembler::new(self.metadata.files());
        let reassembly = tokio::spawn(reassembler.run(loaded_rx, self.write_tx.clone()));

        let scheduler = PieceScheduler::new(
            self.file_id.clone(),
            self.metadata.clone(),
            self.store.clone(),
            loaded_tx,
            self.config.torrent.clone(),
        );
        let result = scheduler.download(connections, download_cancel.clone()).await;

        download_cancel.cancel();
        drop(scheduler);
        if let Err(e) = reassembly.await {
            tracing::error!("Reassembler task failed: {}", e);
        }
        let peers = pool.join().await;
        tracing::debug!(
            "Peer pool for {} stopped with {} known peers",
            self.file_id,
            peers.len()
        );

        if result.is_ok() && !cancel.is_cancelled() {
            tracing::info!("Download for {} completed", self.file_id);
        }
        result
    }

    /// Bytes of the torrent not yet covered by loaded pieces.
    ///
    /// # Errors
    /// - `TorrentError::Storage` - Loaded indexes could not be read
    pub async fn remaining_bytes(&self) -> Result<u64, TorrentError> {
        let loaded: HashSet<u32> = self
            .store
            .loaded_indexes(&self.file_id)
            .await?
            .into_iter()
            .filter(|&index| (index as usize) < self.metadata.piece_count())
            .collect();
        let done: u64 = loaded
            .into_iter()
            .map(|index| u64::from(self.metadata.piece_size(PieceIndex::new(index))))
            .sum();
        Ok(self.metadata.total_length.saturating_sub(done))
    }

    /// Marks the record in progress, downloads it and marks it loaded on
    /// success. The in-progress flag is cleared whatever the outcome.
    ///
    /// A cancelled download is not marked loaded.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TorrentError> {
        self.store.set_in_progress(&self.file_id, true).await?;

        let result = match self.download_to_file(cancel.clone()).await {
            Ok(()) if !cancel.is_cancelled() => self
                .store
                .set_loaded(&self.file_id, true)
                .await
                .map_err(TorrentError::from),
            Ok(()) => {
                tracing::info!("Download for {} cancelled", self.file_id);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Error downloading {}: {}", self.file_id, e);
                Err(e)
            }
        };

        if let Err(e) = self.store.set_in_progress(&self.file_id, false).await {
            tracing::error!("Failed to clear in-progress flag of {}: {}", self.file_id, e);
        }
        result
    }

    /// Replays previously saved parts through the reassembler onto disk.
    ///
    /// Returns the number of parts replayed.
    ///
    /// # Errors
    /// - `TorrentError::Storage` - Parts could not be loaded
    pub async fn save_loaded_pieces_to_fs(&self) -> Result<usize, TorrentError> {
        let capacity = self.config.torrent.results_capacity.max(1);
        let (parts_tx, mut parts_rx) = mpsc::channel(capacity);
        let (loaded_tx, loaded_rx) = mpsc::channel(capacity);

        let reassembler = Reassembler::new(self.metadata.files());
        let reassembly = tokio::spawn(reassembler.run(loaded_rx, self.write_tx.clone()));

        let store = self.store.clone();
        let file_id = self.file_id.clone();
        let loading = tokio::spawn(async move { store.load_parts(&file_id, parts_tx).await });

        let mut replayed = 0usize;
        while let Some(part) = parts_rx.recv().await {
            tracing::debug!("Got {} bytes to save at {}", part.data.len(), part.offset);
            let piece = LoadedPiece {
                start_byte: part.offset,
                length: part.data.len() as u64,
                data: part.data.into(),
            };
            if loaded_tx.send(piece).await.is_err() {
                break;
            }
            replayed += 1;
        }
        drop(loaded_tx);

        if let Err(e) = reassembly.await {
            tracing::error!("Reassembler task failed: {}", e);
        }
        match loading.await {
            Ok(result) => result?,
            Err(e) => tracing::error!("Part loading task failed: {}", e),
        }

        tracing::info!("Replayed {} saved parts of {} to disk", replayed, self.file_id);
        Ok(replayed)
    }
}
