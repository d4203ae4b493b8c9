//! In-memory file record store for development, tests and one-shot downloads

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use super::{FileRecord, FileRecordStore, StorageError, StoredPart, TorrentSource};

#[derive(Debug)]
struct RecordState {
    source: TorrentSource,
    file_name: Option<String>,
    file_length: Option<u64>,
    in_progress: bool,
    loaded: bool,
    parts: Vec<StoredPart>,
}

/// Record store keeping everything in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<String, RecordState>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a record created from `.torrent` bytes.
    pub async fn insert_torrent(&self, id: &str, torrent: Vec<u8>) {
        self.insert(id, TorrentSource::TorrentFile(torrent)).await;
    }

    /// Registers a record created from a magnet link.
    pub async fn insert_magnet(&self, id: &str, magnet_link: &str) {
        self.insert(id, TorrentSource::Magnet(magnet_link.to_string()))
            .await;
    }

    async fn insert(&self, id: &str, source: TorrentSource) {
        self.records.write().await.insert(
            id.to_string(),
            RecordState {
                source,
                file_name: None,
                file_length: None,
                in_progress: false,
                loaded: false,
                parts: Vec::new(),
            },
        );
    }

    /// Saved parts of a record in save order.
    pub async fn saved_parts(&self, id: &str) -> Vec<StoredPart> {
        self.records
            .read()
            .await
            .get(id)
            .map(|record| record.parts.clone())
            .unwrap_or_default()
    }

    async fn update<F>(&self, id: &str, change: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut RecordState) + Send,
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StorageError::RecordNotFound { id: id.to_string() })?;
        change(record);
        Ok(())
    }
}

#[async_trait]
impl FileRecordStore for InMemoryRecordStore {
    async fn record(&self, id: &str) -> Result<FileRecord, StorageError> {
        let records = self.records.read().await;
        let record = records
            .get(id)
            .ok_or_else(|| StorageError::RecordNotFound { id: id.to_string() })?;

        Ok(FileRecord {
            id: id.to_string(),
            file_name: record.file_name.clone(),
            file_length: record.file_length,
            in_progress: record.in_progress,
            loaded: record.loaded,
            loaded_pieces_table: format!("loaded_pieces_{id}"),
        })
    }

    async fn torrent_source(&self, id: &str) -> Result<TorrentSource, StorageError> {
        self.records
            .read()
            .await
            .get(id)
            .map(|record| record.source.clone())
            .ok_or_else(|| StorageError::RecordNotFound { id: id.to_string() })
    }

    async fn loaded_indexes(&self, id: &str) -> Result<Vec<u32>, StorageError> {
        let records = self.records.read().await;
        let record = records
            .get(id)
            .ok_or_else(|| StorageError::RecordNotFound { id: id.to_string() })?;
        Ok(record.parts.iter().map(|part| part.piece_index).collect())
    }

    async fn save_file_part(
        &self,
        id: &str,
        data: &[u8],
        offset: u64,
        length: u64,
        piece_index: u32,
    ) -> Result<(), StorageError> {
        if data.len() as u64 != length {
            return Err(StorageError::FilesystemError {
                reason: format!(
                    "part {piece_index} carries {} bytes, expected {length}",
                    data.len()
                ),
            });
        }
        let part = StoredPart {
            piece_index,
            offset,
            data: data.to_vec(),
        };
        self.update(id, move |record| record.parts.push(part)).await
    }

    async fn set_file_name(&self, id: &str, file_name: &str) -> Result<(), StorageError> {
        let file_name = file_name.to_string();
        self.update(id, move |record| record.file_name = Some(file_name))
            .await
    }

    async fn set_file_length(&self, id: &str, length: u64) -> Result<(), StorageError> {
        self.update(id, |record| record.file_length = Some(length))
            .await
    }

    async fn set_in_progress(&self, id: &str, in_progress: bool) -> Result<(), StorageError> {
        self.update(id, |record| record.in_progress = in_progress)
            .await
    }

    async fn set_loaded(&self, id: &str, loaded: bool) -> Result<(), StorageError> {
        self.update(id, |record| record.loaded = loaded).await
    }

    async fn load_parts(
        &self,
        id: &str,
        out: mpsc::Sender<StoredPart>,
    ) -> Result<(), StorageError> {
        let mut parts = {
            let records = self.records.read().await;
            records
                .get(id)
                .ok_or_else(|| StorageError::RecordNotFound { id: id.to_string() })?
                .parts
                .clone()
        };
        parts.sort_by_key(|part| part.offset);

        for part in parts {
            if out.send(part).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
