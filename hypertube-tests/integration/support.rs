//! Loopback trackers and a download harness shared by the integration tests

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::RawQuery;
use axum::routing::get;
use hypertube_core::HypertubeConfig;
use hypertube_core::storage::{DiskFileWriter, InMemoryRecordStore, spawn_file_writer};
use hypertube_core::torrent::test_fixtures::TorrentFixture;
use hypertube_core::torrent::{BencodeTorrentParser, DownloadSession};
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

pub const FILE_ID: &str = "movie-1";

pub fn compact_peers(peers: &[SocketAddr]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        if let SocketAddr::V4(v4) = peer {
            bytes.extend_from_slice(&v4.ip().octets());
            bytes.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    bytes
}

/// Requests seen by the fake HTTP tracker.
#[derive(Debug, Default)]
pub struct HttpTrackerStats {
    pub announces: AtomicUsize,
    /// `left` query parameter of every announce, in arrival order
    pub lefts: Mutex<Vec<u64>>,
}

fn query_left(query: &str) -> Option<u64> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("left="))
        .and_then(|value| value.parse().ok())
}

/// Serves `peers` as a compact bencoded announce response; returns the
/// announce URL and the request stats.
pub async fn spawn_http_tracker(peers: Vec<SocketAddr>) -> (String, Arc<HttpTrackerStats>) {
    let stats = Arc::new(HttpTrackerStats::default());
    let task_stats = stats.clone();

    let compact = compact_peers(&peers);
    let mut body = b"d8:intervali1800e5:peers".to_vec();
    body.extend_from_slice(compact.len().to_string().as_bytes());
    body.push(b':');
    body.extend_from_slice(&compact);
    body.push(b'e');

    let app = Router::new().route(
        "/announce",
        get(move |RawQuery(query): RawQuery| {
            let body = body.clone();
            task_stats.announces.fetch_add(1, Ordering::SeqCst);
            if let Some(left) = query.as_deref().and_then(query_left) {
                task_stats.lefts.lock().expect("lefts lock").push(left);
            }
            async move { body }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind http tracker");
    let address = listener.local_addr().expect("tracker address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("http://{address}/announce"), stats)
}

/// Request counters of the fake UDP tracker.
#[derive(Debug, Default)]
pub struct UdpTrackerStats {
    pub connects: AtomicUsize,
    pub scrapes: AtomicUsize,
    pub announces: AtomicUsize,
}

/// Answers BEP 15 connect, scrape and announce requests with `peers`.
pub async fn spawn_udp_tracker(peers: Vec<SocketAddr>) -> (String, Arc<UdpTrackerStats>) {
    const CONNECTION_ID: u64 = 0x1122_3344_5566_7788;

    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("bind udp tracker");
    let address = socket.local_addr().expect("tracker address");
    let stats = Arc::new(UdpTrackerStats::default());
    let task_stats = stats.clone();

    tokio::spawn(async move {
        let mut packet = [0u8; 2048];
        while let Ok((len, from)) = socket.recv_from(&mut packet).await {
            if len < 16 {
                continue;
            }
            let action = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);

            let mut reply = Vec::new();
            reply.extend_from_slice(&action.to_be_bytes());
            reply.extend_from_slice(&packet[12..16]);
            match action {
                0 => {
                    task_stats.connects.fetch_add(1, Ordering::SeqCst);
                    reply.extend_from_slice(&CONNECTION_ID.to_be_bytes());
                }
                1 if packet[0..8] == CONNECTION_ID.to_be_bytes() => {
                    task_stats.announces.fetch_add(1, Ordering::SeqCst);
                    reply.extend_from_slice(&1800u32.to_be_bytes());
                    reply.extend_from_slice(&0u32.to_be_bytes());
                    reply.extend_from_slice(&(peers.len() as u32).to_be_bytes());
                    reply.extend_from_slice(&compact_peers(&peers));
                }
                2 => {
                    task_stats.scrapes.fetch_add(1, Ordering::SeqCst);
                    reply.extend_from_slice(&(peers.len() as u32).to_be_bytes());
                    reply.extend_from_slice(&0u32.to_be_bytes());
                    reply.extend_from_slice(&0u32.to_be_bytes());
                }
                _ => continue,
            }
            let _ = socket.send_to(&reply, from).await;
        }
    });

    (format!("udp://{address}"), stats)
}

/// Record store, output directory and writer task around one session.
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<InMemoryRecordStore>,
    pub session: DownloadSession,
    writer_task: JoinHandle<()>,
}

impl Harness {
    pub async fn new(fixture: &TorrentFixture) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let mut config = HypertubeConfig::for_testing();
        config.storage.files_dir = dir.path().to_path_buf();

        let store = Arc::new(InMemoryRecordStore::new());
        store.insert_torrent(FILE_ID, fixture.bytes.clone()).await;

        let metadata = BencodeTorrentParser::new()
            .parse_torrent_data(&fixture.bytes)
            .expect("fixture parses");
        let writer = Arc::new(DiskFileWriter::new(dir.path()));
        let (write_tx, writer_task) = spawn_file_writer(writer.clone(), 64);
        let session =
            DownloadSession::new(FILE_ID, metadata, config, store.clone(), writer, write_tx);

        Self {
            dir,
            store,
            session,
            writer_task,
        }
    }

    /// Drops the session and waits for every queued write to land.
    pub async fn finish(self) -> (TempDir, Arc<InMemoryRecordStore>) {
        drop(self.session);
        self.writer_task.await.expect("writer task");
        (self.dir, self.store)
    }
}
