//! Hypertube Core - BitTorrent download engine for the streaming service
//!
//! This crate provides metadata parsing, tracker communication, the peer wire
//! protocol, the piece scheduler and the reassembly of verified pieces into
//! files on disk, together with configuration and tracing setup.

pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

pub use config::HypertubeConfig;
pub use storage::{FileRecordStore, FileWriter, StorageError, WriteTask};
pub use torrent::{DownloadSession, TorrentError};

/// Core errors that can bubble up from any Hypertube subsystem.
#[derive(Debug, thiserror::Error)]
pub enum HypertubeError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HypertubeError {
    /// Returns a user-friendly error message suitable for an API response.
    pub fn user_message(&self) -> String {
        match self {
            HypertubeError::Torrent(e) => match e {
                TorrentError::MalformedMetadata { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::UnsupportedTrackerScheme { scheme, .. } => {
                    format!("Unsupported tracker scheme: {scheme}")
                }
                TorrentError::TrackerTimeout { url, .. }
                | TorrentError::TrackerUnreachable { url, .. } => {
                    format!("Could not reach tracker: {url}")
                }
                TorrentError::MagnetResolution { reason } => {
                    format!("Could not resolve magnet link: {reason}")
                }
                TorrentError::Storage(StorageError::RecordNotFound { id }) => {
                    format!("File record {id} not found")
                }
                TorrentError::NoPeersAvailable { .. } => "No peers available".to_string(),
                _ => "Download error occurred".to_string(),
            },
            HypertubeError::Storage(StorageError::RecordNotFound { id }) => {
                format!("File record {id} not found")
            }
            HypertubeError::Storage(_) => "Storage error occurred".to_string(),
            HypertubeError::Configuration { reason } => format!("Configuration error: {reason}"),
            HypertubeError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is caused by the caller's input.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            HypertubeError::Configuration { .. }
                | HypertubeError::Torrent(TorrentError::MalformedMetadata { .. })
                | HypertubeError::Torrent(TorrentError::UnsupportedTrackerScheme { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, HypertubeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_for_malformed_metadata() {
        let error = HypertubeError::from(TorrentError::MalformedMetadata {
            reason: "bad pieces".to_string(),
        });
        assert_eq!(error.user_message(), "Invalid torrent file: bad pieces");
        assert!(error.is_user_error());
    }

    #[test]
    fn test_missing_record_is_not_user_error() {
        let error = HypertubeError::from(StorageError::RecordNotFound {
            id: "abc".to_string(),
        });
        assert_eq!(error.user_message(), "File record abc not found");
        assert!(!error.is_user_error());
    }
}
