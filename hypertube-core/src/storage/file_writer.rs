//! Disk file writer and its background write queue

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{FileWriter, StorageError, WriteTask};

/// Writes output files into a single directory.
#[derive(Debug, Clone)]
pub struct DiskFileWriter {
    files_dir: PathBuf,
}

impl DiskFileWriter {
    pub fn new(files_dir: impl Into<PathBuf>) -> Self {
        Self {
            files_dir: files_dir.into(),
        }
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    fn resolve(&self, file_name: &str) -> Result<PathBuf, StorageError> {
        let plain = !file_name.is_empty()
            && !file_name.contains(['/', '\\'])
            && file_name != "."
            && file_name != "..";
        if !plain {
            return Err(StorageError::InvalidFileName {
                name: file_name.to_string(),
            });
        }
        Ok(self.files_dir.join(file_name))
    }
}

#[async_trait]
impl FileWriter for DiskFileWriter {
    async fn write(&self, task: &WriteTask) -> Result<(), StorageError> {
        let path = self.resolve(&task.file_name)?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .await?;
        file.seek(std::io::SeekFrom::Start(task.offset)).await?;
        file.write_all(&task.data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn create_empty_file(&self, file_name: &str) -> Result<(), StorageError> {
        let path = self.resolve(file_name)?;
        fs::create_dir_all(&self.files_dir).await?;
        fs::File::create(&path).await?;
        tracing::debug!("Created empty file {}", path.display());
        Ok(())
    }
}

/// Starts a task draining write tasks into `writer`.
///
/// Writes are applied in arrival order. A failed write is logged and the
/// queue keeps draining. The task ends once every sender is dropped.
pub fn spawn_file_writer(
    writer: Arc<dyn FileWriter>,
    capacity: usize,
) -> (mpsc::Sender<WriteTask>, JoinHandle<()>) {
    let (write_tx, mut write_rx) = mpsc::channel::<WriteTask>(capacity.max(1));

    let handle = tokio::spawn(async move {
        while let Some(task) = write_rx.recv().await {
            if let Err(e) = writer.write(&task).await {
                tracing::error!(
                    "Failed to write {} bytes at offset {} of {}: {}",
                    task.data.len(),
                    task.offset,
                    task.file_name,
                    e
                );
            }
        }
    });

    (write_tx, handle)
}
