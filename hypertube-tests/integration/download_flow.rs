//! Single-file downloads through an HTTP tracker

use std::sync::atomic::Ordering;
use std::time::Duration;

use hypertube_core::FileRecordStore;
use hypertube_core::torrent::test_fixtures::{
    SeederBehavior, TorrentFixtureBuilder, pattern_content, spawn_seeder,
};
use tokio_util::sync::CancellationToken;

use crate::support::{FILE_ID, Harness, spawn_http_tracker, spawn_udp_tracker};

const BLOCK: usize = 16384;

#[tokio::test]
async fn test_four_peers_serving_one_piece_each() {
    let content = pattern_content(BLOCK * 3 + 1000);
    let mut seeders = Vec::new();
    let template = TorrentFixtureBuilder::new("movie.mkv")
        .piece_length(BLOCK as u32)
        .build_single(content.clone());
    for piece in 0..4 {
        seeders.push(spawn_seeder(template.clone(), vec![piece], SeederBehavior::Honest).await);
    }
    let peers = seeders.iter().map(|seeder| seeder.address).collect();
    let (announce, tracker) = spawn_http_tracker(peers).await;

    let fixture = TorrentFixtureBuilder::new("movie.mkv")
        .announce(&announce)
        .piece_length(BLOCK as u32)
        .build_single(content.clone());
    assert_eq!(fixture.info_hash, template.info_hash);
    assert_eq!(fixture.piece_count(), 4);

    let harness = Harness::new(&fixture).await;
    let (file_name, length) = harness.session.prepare_file().await.unwrap();
    assert_eq!(length, content.len() as u64);

    tokio::time::timeout(
        Duration::from_secs(20),
        harness.session.run(CancellationToken::new()),
    )
    .await
    .expect("download did not finish")
    .unwrap();

    let (dir, store) = harness.finish().await;
    assert!(tracker.announces.load(Ordering::SeqCst) >= 1);

    let parts = store.saved_parts(FILE_ID).await;
    assert_eq!(parts.len(), 4);
    let mut indexes: Vec<u32> = parts.iter().map(|part| part.piece_index).collect();
    indexes.sort_unstable();
    assert_eq!(indexes, vec![0, 1, 2, 3]);
    let last = parts.iter().find(|part| part.piece_index == 3).unwrap();
    assert_eq!(last.data.len(), 1000);
    assert_eq!(last.offset, 3 * BLOCK as u64);

    let record = store.record(FILE_ID).await.unwrap();
    assert!(record.loaded);
    assert!(!record.in_progress);

    let written = tokio::fs::read(dir.path().join(&file_name)).await.unwrap();
    assert_eq!(written, content);

    for seeder in &seeders {
        assert!(seeder.stats.blocks_served.load(Ordering::SeqCst) >= 1);
    }
}

#[tokio::test]
async fn test_resumed_download_fetches_only_missing_pieces() {
    let content = pattern_content(BLOCK * 2 + 10);
    let template = TorrentFixtureBuilder::new("movie.mkv")
        .piece_length(BLOCK as u32)
        .build_single(content.clone());
    let seeder = spawn_seeder(template.clone(), vec![0, 1, 2], SeederBehavior::Honest).await;
    let (announce, tracker) = spawn_http_tracker(vec![seeder.address]).await;
    let fixture = TorrentFixtureBuilder::new("movie.mkv")
        .announce(&announce)
        .piece_length(BLOCK as u32)
        .build_single(content.clone());

    let harness = Harness::new(&fixture).await;
    harness.session.prepare_file().await.unwrap();
    harness
        .store
        .save_file_part(FILE_ID, fixture.piece(1), BLOCK as u64, BLOCK as u64, 1)
        .await
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(20),
        harness.session.run(CancellationToken::new()),
    )
    .await
    .expect("download did not finish")
    .unwrap();

    let lefts = tracker.lefts.lock().unwrap().clone();
    assert!(!lefts.is_empty());
    assert!(lefts.iter().all(|&left| left == (BLOCK + 10) as u64));

    let (_dir, store) = harness.finish().await;
    let mut indexes = store.loaded_indexes(FILE_ID).await.unwrap();
    assert_eq!(indexes.len(), 3);
    indexes.sort_unstable();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert!(store.record(FILE_ID).await.unwrap().loaded);
}

#[tokio::test]
async fn test_corrupt_seeder_does_not_fail_download() {
    let content = pattern_content(BLOCK * 2);
    let template = TorrentFixtureBuilder::new("movie.mkv")
        .piece_length(BLOCK as u32)
        .build_single(content.clone());
    let corrupt = spawn_seeder(template.clone(), vec![0, 1], SeederBehavior::Corrupt).await;
    let honest = spawn_seeder(template.clone(), vec![0, 1], SeederBehavior::Honest).await;
    let (announce, _) = spawn_http_tracker(vec![corrupt.address, honest.address]).await;
    let fixture = TorrentFixtureBuilder::new("movie.mkv")
        .announce(&announce)
        .piece_length(BLOCK as u32)
        .build_single(content.clone());

    let harness = Harness::new(&fixture).await;
    let (file_name, _) = harness.session.prepare_file().await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(20),
        harness.session.run(CancellationToken::new()),
    )
    .await
    .expect("download did not finish")
    .unwrap();

    let (dir, store) = harness.finish().await;
    assert_eq!(store.saved_parts(FILE_ID).await.len(), 2);
    let written = tokio::fs::read(dir.path().join(file_name)).await.unwrap();
    assert_eq!(written, content);
}

#[tokio::test]
async fn test_fallback_tracker_used_when_primary_is_silent() {
    let content = pattern_content(BLOCK + 500);
    let template = TorrentFixtureBuilder::new("movie.mkv")
        .piece_length(BLOCK as u32)
        .build_single(content.clone());
    let seeder = spawn_seeder(template.clone(), vec![0, 1], SeederBehavior::Honest).await;
    let (fallback, fallback_tracker) = spawn_http_tracker(vec![seeder.address]).await;
    let silent = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let address = socket.local_addr().unwrap();
        // Keep the port bound so datagrams are swallowed rather than refused
        std::mem::forget(socket);
        format!("udp://{address}")
    };

    let fixture = TorrentFixtureBuilder::new("movie.mkv")
        .announce(&silent)
        .fallback(&fallback)
        .piece_length(BLOCK as u32)
        .build_single(content);

    let harness = Harness::new(&fixture).await;
    harness.session.prepare_file().await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(20),
        harness.session.run(CancellationToken::new()),
    )
    .await
    .expect("download did not finish")
    .unwrap();

    let (_dir, store) = harness.finish().await;
    assert!(fallback_tracker.announces.load(Ordering::SeqCst) >= 1);
    assert!(store.record(FILE_ID).await.unwrap().loaded);
}

#[tokio::test]
async fn test_cancellation_returns_promptly_without_loading() {
    let content = pattern_content(BLOCK * 2);
    let template = TorrentFixtureBuilder::new("movie.mkv")
        .piece_length(BLOCK as u32)
        .build_single(content.clone());
    let choking = spawn_seeder(template.clone(), vec![0, 1], SeederBehavior::Choking).await;
    let (announce, stats) = spawn_udp_tracker(vec![choking.address]).await;
    let fixture = TorrentFixtureBuilder::new("movie.mkv")
        .announce(&announce)
        .piece_length(BLOCK as u32)
        .build_single(content);

    let harness = Harness::new(&fixture).await;
    harness.session.prepare_file().await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(3), harness.session.run(cancel))
        .await
        .expect("cancelled download kept running");
    assert!(result.is_ok());

    let (_dir, store) = harness.finish().await;
    let record = store.record(FILE_ID).await.unwrap();
    assert!(!record.loaded);
    assert!(!record.in_progress);
    assert!(store.saved_parts(FILE_ID).await.is_empty());
    assert!(stats.announces.load(Ordering::SeqCst) >= 1);
}
