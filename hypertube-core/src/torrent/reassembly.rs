//! Routes verified pieces onto the torrent's files
//!
//! Pieces are addressed in the concatenated stream of all files. Each file
//! owns a `[start, end)` range of that stream; a piece straddling a file
//! boundary becomes one write task per file it touches.

use tokio::sync::mpsc;

use super::parsing::TorrentFile;
use super::scheduler::LoadedPiece;
use crate::storage::WriteTask;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileSpan {
    file_name: String,
    start: u64,
    end: u64,
}

/// Maps absolute byte ranges to per-file write tasks.
#[derive(Debug, Clone)]
pub struct Reassembler {
    spans: Vec<FileSpan>,
}

impl Reassembler {
    /// Builds file spans by prefix-summing lengths in declared order.
    ///
    /// Files are written under their encoded names.
    pub fn new(files: &[TorrentFile]) -> Self {
        let named = files
            .iter()
            .map(|file| (file.encoded_file_name(), file.length));
        Self::from_named(named)
    }

    /// Builds spans for an explicit list of `(file name, length)` pairs.
    pub fn from_named(files: impl IntoIterator<Item = (String, u64)>) -> Self {
        let mut start = 0u64;
        let spans = files
            .into_iter()
            .map(|(file_name, length)| {
                let span = FileSpan {
                    file_name,
                    start,
                    end: start + length,
                };
                start = span.end;
                span
            })
            .collect();
        Self { spans }
    }

    /// Write tasks for every file the piece intersects.
    pub fn write_tasks(&self, piece: &LoadedPiece) -> Vec<WriteTask> {
        let piece_length = piece.length.min(piece.data.len() as u64);
        let piece_start = piece.start_byte;
        let piece_end = piece_start + piece_length;

        self.spans
            .iter()
            .filter(|span| span.start < piece_end && piece_start < span.end)
            .map(|span| {
                let slice_begin = span.start.saturating_sub(piece_start);
                let slice_end = piece_length - piece_end.saturating_sub(span.end);
                WriteTask {
                    file_name: span.file_name.clone(),
                    offset: piece_start.saturating_sub(span.start),
                    data: piece.data.slice(slice_begin as usize..slice_end as usize),
                }
            })
            .collect()
    }

    /// Forwards write tasks for each incoming piece until either side closes.
    pub async fn run(
        self,
        mut loaded_rx: mpsc::Receiver<LoadedPiece>,
        write_tx: mpsc::Sender<WriteTask>,
    ) {
        while let Some(piece) = loaded_rx.recv().await {
            for task in self.write_tasks(&piece) {
                if write_tx.send(task).await.is_err() {
                    tracing::warn!("File writer stopped, dropping reassembled data");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn piece(start_byte: u64, length: usize) -> LoadedPiece {
        LoadedPiece {
            start_byte,
            length: length as u64,
            data: Bytes::from((0..length).map(|i| i as u8).collect::<Vec<u8>>()),
        }
    }

    fn two_files() -> Reassembler {
        Reassembler::from_named([("first".to_string(), 1000), ("second".to_string(), 500)])
    }

    #[test]
    fn test_piece_straddling_two_files() {
        let loaded = piece(900, 200);
        let tasks = two_files().write_tasks(&loaded);

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].file_name, "first");
        assert_eq!(tasks[0].offset, 900);
        assert_eq!(tasks[0].data, loaded.data.slice(..100));
        assert_eq!(tasks[1].file_name, "second");
        assert_eq!(tasks[1].offset, 0);
        assert_eq!(tasks[1].data, loaded.data.slice(100..));
    }

    #[test]
    fn test_piece_inside_one_file() {
        let tasks = two_files().write_tasks(&piece(1100, 100));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].file_name, "second");
        assert_eq!(tasks[0].offset, 100);
        assert_eq!(tasks[0].data.len(), 100);
    }

    #[test]
    fn test_piece_ending_on_boundary_touches_one_file() {
        let tasks = two_files().write_tasks(&piece(800, 200));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].file_name, "first");
        assert_eq!(tasks[0].offset, 800);
    }

    #[test]
    fn test_empty_files_get_no_writes() {
        let reassembler = Reassembler::from_named([
            ("a".to_string(), 10),
            ("empty".to_string(), 0),
            ("b".to_string(), 10),
        ]);
        let tasks = reassembler.write_tasks(&piece(0, 20));
        let names: Vec<&str> = tasks.iter().map(|task| task.file_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_encoded_names_from_torrent_files() {
        let file = TorrentFile {
            path: vec!["dir".to_string(), "movie.mkv".to_string()],
            length: 64,
        };
        let tasks = Reassembler::new(std::slice::from_ref(&file)).write_tasks(&piece(0, 64));
        assert_eq!(tasks[0].file_name, file.encoded_file_name());
    }

    #[tokio::test]
    async fn test_run_forwards_tasks_in_order() {
        let (loaded_tx, loaded_rx) = mpsc::channel(4);
        let (write_tx, mut write_rx) = mpsc::channel(4);
        let task = tokio::spawn(two_files().run(loaded_rx, write_tx));

        loaded_tx.send(piece(900, 200)).await.unwrap();
        drop(loaded_tx);
        task.await.unwrap();

        assert_eq!(write_rx.recv().await.unwrap().file_name, "first");
        assert_eq!(write_rx.recv().await.unwrap().file_name, "second");
        assert!(write_rx.recv().await.is_none());
    }
}
