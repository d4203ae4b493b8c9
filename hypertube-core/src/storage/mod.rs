//! Storage collaborators of the download engine.
//!
//! The engine records resume state through [`FileRecordStore`] and hands
//! byte ranges to a [`FileWriter`]. An in-memory record store and a disk
//! writer are provided; the service can plug in database-backed stores.

pub mod file_writer;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use file_writer::{DiskFileWriter, spawn_file_writer};
pub use memory::InMemoryRecordStore;

/// Bytes to write at an absolute offset of one output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTask {
    pub file_name: String,
    pub offset: u64,
    pub data: Bytes,
}

/// Part of a file saved after piece verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPart {
    pub piece_index: u32,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// What a file record was created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentSource {
    /// Raw `.torrent` file bytes
    TorrentFile(Vec<u8>),
    /// Magnet URI to be resolved first
    Magnet(String),
}

/// Status of a file record as reported to API callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: String,
    pub file_name: Option<String>,
    pub file_length: Option<u64>,
    pub in_progress: bool,
    pub loaded: bool,
    /// Name of the table holding this record's saved parts
    pub loaded_pieces_table: String,
}

/// Persistent state of downloadable file records.
///
/// The engine only appends to the loaded-piece state, it never rewrites it.
#[async_trait]
pub trait FileRecordStore: Send + Sync {
    /// Returns the record's status fields.
    ///
    /// # Errors
    ///
    /// - `StorageError::RecordNotFound` - If no record has this id
    async fn record(&self, id: &str) -> Result<FileRecord, StorageError>;

    /// Returns the `.torrent` bytes or magnet link the record was created from.
    ///
    /// # Errors
    ///
    /// - `StorageError::RecordNotFound` - If no record has this id
    async fn torrent_source(&self, id: &str) -> Result<TorrentSource, StorageError>;

    /// Name of the table holding the record's saved parts.
    async fn loaded_pieces_table(&self, id: &str) -> Result<String, StorageError> {
        Ok(self.record(id).await?.loaded_pieces_table)
    }

    /// Piece indices already saved for the record, used as a resume skip-list.
    async fn loaded_indexes(&self, id: &str) -> Result<Vec<u32>, StorageError>;

    /// Appends one verified part of the record's file.
    async fn save_file_part(
        &self,
        id: &str,
        data: &[u8],
        offset: u64,
        length: u64,
        piece_index: u32,
    ) -> Result<(), StorageError>;

    async fn set_file_name(&self, id: &str, file_name: &str) -> Result<(), StorageError>;

    async fn set_file_length(&self, id: &str, length: u64) -> Result<(), StorageError>;

    async fn set_in_progress(&self, id: &str, in_progress: bool) -> Result<(), StorageError>;

    async fn set_loaded(&self, id: &str, loaded: bool) -> Result<(), StorageError>;

    /// Streams saved parts in offset order into `out`.
    ///
    /// Returns when every part has been sent or the receiver is gone.
    async fn load_parts(
        &self,
        id: &str,
        out: mpsc::Sender<StoredPart>,
    ) -> Result<(), StorageError>;
}

/// Destination of reassembled byte ranges.
#[async_trait]
pub trait FileWriter: Send + Sync {
    /// Writes `task.data` at `task.offset` of `task.file_name`.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the file cannot be opened or written
    async fn write(&self, task: &WriteTask) -> Result<(), StorageError>;

    /// Creates an empty file, truncating any previous content.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the file cannot be created
    async fn create_empty_file(&self, file_name: &str) -> Result<(), StorageError>;
}

/// Errors that occur in storage collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("File record {id} not found")]
    RecordNotFound { id: String },

    #[error("Invalid file name: {name}")]
    InvalidFileName { name: String },

    #[error("Filesystem error: {reason}")]
    FilesystemError { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
