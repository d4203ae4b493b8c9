//! Multi-file torrents: pieces straddling file boundaries land in every file

use std::time::Duration;

use hypertube_core::FileRecordStore;
use hypertube_core::torrent::test_fixtures::{
    SeederBehavior, TorrentFixtureBuilder, pattern_content, spawn_seeder,
};
use tokio_util::sync::CancellationToken;

use crate::support::{FILE_ID, Harness, spawn_http_tracker};

fn files() -> Vec<(&'static [&'static str], Vec<u8>)> {
    let subtitles = pattern_content(1000);
    let movie: Vec<u8> = pattern_content(30_000).into_iter().rev().collect();
    let extras = pattern_content(500);
    vec![
        (&["Show", "subs.srt"][..], subtitles),
        (&["Show", "episode.mkv"][..], movie),
        (&["extras.nfo"][..], extras),
    ]
}

fn builder(announce: Option<&str>) -> TorrentFixtureBuilder {
    let mut builder = TorrentFixtureBuilder::new("Show").piece_length(16384);
    if let Some(announce) = announce {
        builder = builder.announce(announce);
    }
    for (path, content) in files() {
        builder = builder.file(path, content);
    }
    builder
}

#[tokio::test]
async fn test_multi_file_download_reassembles_each_file() {
    let template = builder(None).build_multi();
    let seeder = spawn_seeder(
        template.clone(),
        (0..template.piece_count()).collect(),
        SeederBehavior::Honest,
    )
    .await;
    let (announce, _) = spawn_http_tracker(vec![seeder.address]).await;
    let fixture = builder(Some(&announce)).build_multi();

    let harness = Harness::new(&fixture).await;
    let metadata = harness.session.metadata().clone();
    assert!(metadata.layout.is_multi_file());
    assert_eq!(metadata.total_length, 31_500);

    let (file_name, length) = harness.session.prepare_file().await.unwrap();
    assert_eq!(length, 30_000);
    assert_eq!(file_name, metadata.files()[1].encoded_file_name());

    tokio::time::timeout(
        Duration::from_secs(20),
        harness.session.run(CancellationToken::new()),
    )
    .await
    .expect("download did not finish")
    .unwrap();

    let (dir, store) = harness.finish().await;
    assert!(store.record(FILE_ID).await.unwrap().loaded);

    for (file, (_, expected)) in metadata.files().iter().zip(files()) {
        let written = tokio::fs::read(dir.path().join(file.encoded_file_name()))
            .await
            .unwrap();
        assert_eq!(written, expected, "content of {}", file.display_path());
    }
}

#[tokio::test]
async fn test_replay_rebuilds_files_from_saved_parts() {
    let fixture = builder(Some("http://127.0.0.1:9/announce")).build_multi();
    let harness = Harness::new(&fixture).await;
    let metadata = harness.session.metadata().clone();
    harness.session.prepare_file().await.unwrap();

    for index in (0..fixture.piece_count()).rev() {
        let piece = fixture.piece(index);
        let offset = index as u64 * 16384;
        harness
            .store
            .save_file_part(FILE_ID, piece, offset, piece.len() as u64, index as u32)
            .await
            .unwrap();
    }

    let replayed = harness.session.save_loaded_pieces_to_fs().await.unwrap();
    assert_eq!(replayed, fixture.piece_count());

    let (dir, _store) = harness.finish().await;
    for (file, (_, expected)) in metadata.files().iter().zip(files()) {
        let written = tokio::fs::read(dir.path().join(file.encoded_file_name()))
            .await
            .unwrap();
        assert_eq!(written, expected);
    }
}
