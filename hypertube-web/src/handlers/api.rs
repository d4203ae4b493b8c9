//! Download-trigger and part-replay endpoints

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use hypertube_core::torrent::load_metadata;
use hypertube_core::{DownloadSession, FileRecordStore};
use serde::{Deserialize, Serialize};

use super::utils::{ApiError, ApiResponse};
use crate::server::AppState;

/// Query carrying the file record id.
#[derive(Debug, Deserialize)]
pub struct FileQuery {
    /// Id of the file record
    pub file_id: String,
}

/// Status returned when a download is triggered.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    /// Always false; the download continues in the background
    pub is_loaded: bool,
    /// Echo of the file id
    pub key: String,
    /// Table the saved parts are written to
    pub loaded_pieces_table: String,
    /// On-disk name of the streamed file
    pub file_name: String,
}

/// Parts replayed by the write endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    /// Number of saved parts written to disk
    pub replayed_parts: usize,
}

/// `GET /torrent/download?file_id=`
///
/// Prepares the streamed file, replays saved parts and starts the download
/// in the background, answering before any piece is fetched.
///
/// # Errors
///
/// - 404 - Unknown file record
/// - 400 - Torrent has no tracker URL
/// - 500 - Torrent could not be decoded or the file could not be prepared
pub async fn download_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<Json<ApiResponse<FileStatus>>, ApiError> {
    let file_id = query.file_id;
    let loaded_pieces_table = state.store.loaded_pieces_table(&file_id).await?;
    let session = open_session(&state, &file_id).await?;

    if session.metadata().tracker_urls().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Announce is empty"));
    }

    let (file_name, _) = session.prepare_file().await?;
    let session = Arc::new(session);

    let replay = session.clone();
    tokio::spawn(async move {
        if let Err(e) = replay.save_loaded_pieces_to_fs().await {
            tracing::error!("Failed to replay saved parts of {}: {}", replay.file_id(), e);
        }
    });

    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        if let Err(e) = session.run(cancel).await {
            tracing::debug!("Background download of {} ended: {}", session.file_id(), e);
        }
    });

    tracing::info!("Started download of {} into {}", file_id, file_name);
    Ok(ApiResponse::ok(FileStatus {
        is_loaded: false,
        key: file_id,
        loaded_pieces_table,
        file_name,
    }))
}

/// `GET /torrent/write?file_id=`
///
/// Replays every saved part of the record onto disk.
///
/// # Errors
///
/// - 404 - Unknown file record
/// - 500 - Torrent could not be decoded or parts could not be loaded
pub async fn write_loaded_parts(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<Json<ApiResponse<ReplayReport>>, ApiError> {
    let session = open_session(&state, &query.file_id).await?;
    let replayed_parts = session.save_loaded_pieces_to_fs().await?;
    Ok(ApiResponse::ok(ReplayReport { replayed_parts }))
}

async fn open_session(state: &AppState, file_id: &str) -> Result<DownloadSession, ApiError> {
    let store: &dyn FileRecordStore = state.store.as_ref();
    let metadata = load_metadata(store, state.resolver.as_ref(), file_id).await?;
    Ok(DownloadSession::new(
        file_id,
        metadata,
        state.config.as_ref().clone(),
        state.store.clone(),
        state.writer.clone(),
        state.write_tx.clone(),
    ))
}
