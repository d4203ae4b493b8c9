//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use hypertube_core::storage::{DiskFileWriter, InMemoryRecordStore, spawn_file_writer};
use hypertube_core::torrent::{BencodeTorrentParser, DownloadSession, UnconfiguredMagnetResolver};
use hypertube_core::{FileRecordStore, HypertubeConfig, HypertubeError, Result};
use tokio_util::sync::CancellationToken;

const CLI_RECORD_ID: &str = "cli";

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the download API server
    Serve {
        /// Host to bind to, overrides HYPERTUBE_HOST
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to, overrides HYPERTUBE_PORT
        #[arg(short, long)]
        port: Option<u16>,
        /// Preload a file record from a torrent file, as ID=PATH
        #[arg(long = "record", value_parser = parse_record)]
        records: Vec<(String, PathBuf)>,
    },
    /// Download a local torrent file
    Download {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Directory receiving the downloaded files, overrides FILES_DIR
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands, config: HypertubeConfig) -> Result<()> {
    match command {
        Commands::Serve {
            host,
            port,
            records,
        } => serve(config, host, port, records).await,
        Commands::Download {
            torrent,
            output_dir,
            timeout,
        } => download(config, torrent, output_dir, timeout.map(Duration::from_secs)).await,
    }
}

fn parse_record(value: &str) -> std::result::Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((id, path)) if !id.is_empty() && !path.is_empty() => {
            Ok((id.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected ID=PATH, got '{value}'")),
    }
}

/// Serve the download API backed by an in-memory record store
///
/// # Errors
/// - `HypertubeError::Io` - A preloaded torrent file could not be read
/// - `HypertubeError::Configuration` - The server failed to start
pub async fn serve(
    mut config: HypertubeConfig,
    host: Option<String>,
    port: Option<u16>,
    records: Vec<(String, PathBuf)>,
) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let store = Arc::new(InMemoryRecordStore::new());
    for (id, path) in records {
        let torrent = tokio::fs::read(&path).await?;
        store.insert_torrent(&id, torrent).await;
        tracing::info!("Loaded record {} from {}", id, path.display());
    }

    hypertube_web::run_server(config, store, Arc::new(UnconfiguredMagnetResolver))
        .await
        .map_err(|e| HypertubeError::Configuration {
            reason: format!("server failed: {e}"),
        })
}

/// Download a torrent file into a directory, stopping on Ctrl-C
///
/// # Errors
/// - `HypertubeError::Io` - The torrent file could not be read
/// - `HypertubeError::Torrent` - Metadata was malformed or the download failed
pub async fn download(
    mut config: HypertubeConfig,
    torrent: PathBuf,
    output_dir: Option<PathBuf>,
    timeout: Option<Duration>,
) -> Result<()> {
    if let Some(output_dir) = output_dir {
        config.storage.files_dir = output_dir;
    }

    let metadata = BencodeTorrentParser::new().parse_torrent_file(&torrent).await?;
    tracing::info!(
        "Downloading {} ({} bytes in {} pieces) into {}",
        metadata.name,
        metadata.total_length,
        metadata.piece_count(),
        config.storage.files_dir.display()
    );

    let piece_count = metadata.piece_count();

    let store = Arc::new(InMemoryRecordStore::new());
    store
        .insert_torrent(CLI_RECORD_ID, tokio::fs::read(&torrent).await?)
        .await;

    let writer = Arc::new(DiskFileWriter::new(config.storage.files_dir.clone()));
    let (write_tx, writer_task) =
        spawn_file_writer(writer.clone(), config.storage.write_queue_capacity);
    let session = DownloadSession::new(
        CLI_RECORD_ID,
        metadata,
        config,
        store.clone(),
        writer,
        write_tx,
    );
    let (file_name, length) = session.prepare_file().await?;

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        match timeout {
            Some(limit) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = tokio::time::sleep(limit) => {
                        tracing::warn!("Download timed out after {:?}", limit);
                    }
                }
            }
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        stop.cancel();
    });

    let result = session.run(cancel.clone()).await;
    drop(session);
    if let Err(e) = writer_task.await {
        tracing::error!("File writer task failed: {}", e);
    }
    result?;

    if cancel.is_cancelled() {
        let loaded = store.loaded_indexes(CLI_RECORD_ID).await?.len();
        return Err(HypertubeError::Io(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            format!("download stopped with {loaded} of {piece_count} pieces"),
        )));
    }

    println!("Downloaded {file_name} ({length} bytes)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record() {
        assert_eq!(
            parse_record("42=/tmp/a.torrent").unwrap(),
            ("42".to_string(), PathBuf::from("/tmp/a.torrent"))
        );
        assert!(parse_record("42").is_err());
        assert!(parse_record("=path").is_err());
    }
}
