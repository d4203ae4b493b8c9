//! Downloads through a BEP 15 UDP tracker

use std::sync::atomic::Ordering;
use std::time::Duration;

use hypertube_core::FileRecordStore;
use hypertube_core::torrent::test_fixtures::{
    SeederBehavior, TorrentFixtureBuilder, pattern_content, spawn_seeder,
};
use tokio_util::sync::CancellationToken;

use crate::support::{FILE_ID, Harness, spawn_udp_tracker};

#[tokio::test]
async fn test_udp_tracker_download() {
    let content = pattern_content(16384 * 4);
    let template = TorrentFixtureBuilder::new("clip.mp4")
        .piece_length(16384)
        .build_single(content.clone());
    let first = spawn_seeder(template.clone(), vec![0, 1, 2, 3], SeederBehavior::Honest).await;
    let second = spawn_seeder(template.clone(), vec![0, 1, 2, 3], SeederBehavior::Honest).await;
    let (announce, stats) = spawn_udp_tracker(vec![first.address, second.address]).await;

    let fixture = TorrentFixtureBuilder::new("clip.mp4")
        .announce(&announce)
        .piece_length(16384)
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
    assert!(store.record(FILE_ID).await.unwrap().loaded);
    assert_eq!(store.saved_parts(FILE_ID).await.len(), 4);
    assert_eq!(
        tokio::fs::read(dir.path().join(file_name)).await.unwrap(),
        content
    );

    assert!(stats.connects.load(Ordering::SeqCst) >= 1);
    assert!(stats.scrapes.load(Ordering::SeqCst) >= 1);
    assert!(stats.announces.load(Ordering::SeqCst) >= 1);

    let haves = first.stats.haves_received.load(Ordering::SeqCst)
        + second.stats.haves_received.load(Ordering::SeqCst);
    assert!(haves >= 1);
}
