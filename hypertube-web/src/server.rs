//! Axum server wiring for the download API

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use hypertube_core::storage::{DiskFileWriter, WriteTask, spawn_file_writer};
use hypertube_core::torrent::MagnetResolver;
use hypertube_core::{FileRecordStore, FileWriter, HypertubeConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{download_file, write_loaded_parts};

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Process configuration
    pub config: Arc<HypertubeConfig>,
    /// File record collaborator
    pub store: Arc<dyn FileRecordStore>,
    /// Magnet-to-torrent collaborator
    pub resolver: Arc<dyn MagnetResolver>,
    /// Creates output files
    pub writer: Arc<dyn FileWriter>,
    /// Queue drained by the file writer task
    pub write_tx: mpsc::Sender<WriteTask>,
    /// Cancels background downloads on shutdown
    pub shutdown: CancellationToken,
}

/// Builds the API router over `state`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/torrent/download", get(download_file))
        .route("/torrent/write", get(write_loaded_parts))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API until Ctrl-C, then cancels running downloads.
///
/// # Errors
///
/// - Returns an error if the listener cannot bind the configured address
pub async fn run_server(
    config: HypertubeConfig,
    store: Arc<dyn FileRecordStore>,
    resolver: Arc<dyn MagnetResolver>,
) -> Result<(), Box<dyn std::error::Error>> {
    let writer = Arc::new(DiskFileWriter::new(config.storage.files_dir.clone()));
    let (write_tx, writer_task) =
        spawn_file_writer(writer.clone(), config.storage.write_queue_capacity);
    let shutdown = CancellationToken::new();
    let address = format!("{}:{}", config.server.host, config.server.port);

    let state = AppState {
        config: Arc::new(config),
        store,
        resolver,
        writer,
        write_tx,
        shutdown: shutdown.clone(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!("Hypertube API listening on http://{}", address);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    writer_task.abort();
    tracing::info!("Hypertube API stopped");
    Ok(())
}
