// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Supervision integration tests: registry, custodian grooming, and the
//! supervisor table invariants that do not need a live encoder.
//!
//! Run with: `cargo test`

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use camwatch::cameras::{Camera, CameraRegistry};
use camwatch::config::Settings;
use camwatch::encoder::EncoderDriver;
use camwatch::error::CamError;
use camwatch::fsutil;
use camwatch::recording::RecordingSupervisor;
use camwatch::resources::ResourceMonitor;
use camwatch::streaming::{restart_backoff, StreamingSupervisor};

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

/// Write a file and backdate its mtime.
fn write_aged(path: &Path, bytes: usize, age: Duration) {
    std::fs::write(path, vec![0xABu8; bytes]).expect("write file");
    let file = OpenOptions::new().write(true).open(path).expect("open");
    file.set_modified(SystemTime::now() - age).expect("set mtime");
}

fn write_camera_file(dir: &Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("cam_config.txt");
    std::fs::write(&path, content).expect("write camera file");
    path
}

// ──────────────── registry ────────────────────────────────────────────────

#[test]
fn test_registry_load_and_filtering() {
    let dir = tmp_dir();
    let path = write_camera_file(
        dir.path(),
        "cam1,Front,rtsp://x/1,1\n\
         cam2,Back,rtsp://x/2,0\n\
         cam3,Side,rtsp://x/3\n\
         cam4,NoUrl,\n",
    );
    let registry = CameraRegistry::new(path);

    let all = registry.cameras().expect("load");
    assert_eq!(all.len(), 3, "URL-less line is skipped");

    let enabled = registry.enabled_cameras().expect("enabled");
    let ids: Vec<&str> = enabled.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["cam1", "cam3"], "missing flag defaults to enabled");

    let cam2 = registry.get("cam2").expect("cam2");
    assert!(!registry.streaming_allowed(&cam2));
    assert!(registry.recording_allowed(&cam2));

    assert!(matches!(
        registry.get("nope"),
        Err(CamError::CameraNotFound { .. })
    ));
}

#[test]
fn test_registry_reload_invalidates_cache() {
    let dir = tmp_dir();
    let path = write_camera_file(dir.path(), "cam1,Front,rtsp://x/1,1\n");
    let registry = CameraRegistry::new(path.clone());
    assert_eq!(registry.cameras().expect("load").len(), 1);

    // Rewrite behind the cache's back: stale until reloaded.
    std::fs::write(&path, "cam1,Front,rtsp://x/1,1\ncam2,Back,rtsp://x/2,1\n").expect("rewrite");
    assert_eq!(registry.cameras().expect("cached").len(), 1);
    assert_eq!(registry.reload().expect("reload").len(), 2);
}

#[test]
fn test_registry_rejects_bad_enabled_flag() {
    let dir = tmp_dir();
    let path = write_camera_file(dir.path(), "cam1,Front,rtsp://x/1,maybe\n");
    let registry = CameraRegistry::new(path);
    assert!(matches!(registry.cameras(), Err(CamError::Config(_))));
}

// ──────────────── custodian ───────────────────────────────────────────────

#[test]
fn test_cleanup_directory_by_age_and_count() {
    let dir = tmp_dir();

    write_aged(&dir.path().join("old.mp4"), 2048, Duration::from_secs(3600));
    write_aged(&dir.path().join("new1.mp4"), 2048, Duration::from_secs(10));
    write_aged(&dir.path().join("new2.mp4"), 2048, Duration::from_secs(20));
    write_aged(&dir.path().join("new3.mp4"), 2048, Duration::from_secs(30));
    // Wrong extension is never touched.
    write_aged(&dir.path().join("keep.ts"), 2048, Duration::from_secs(3600));

    // Age pass removes old.mp4; count cap 2 then removes the oldest survivor.
    let deleted = fsutil::cleanup_directory(
        dir.path(),
        "mp4",
        Some(Duration::from_secs(600)),
        Some(2),
    );
    assert_eq!(deleted, 2);
    assert!(!dir.path().join("old.mp4").exists());
    assert!(!dir.path().join("new3.mp4").exists());
    assert!(dir.path().join("new1.mp4").exists());
    assert!(dir.path().join("new2.mp4").exists());
    assert!(dir.path().join("keep.ts").exists());
}

#[test]
fn test_cleanup_directory_drops_undersized_files() {
    let dir = tmp_dir();
    write_aged(&dir.path().join("tiny.mp4"), 100, Duration::from_secs(1));
    write_aged(&dir.path().join("fine.mp4"), 4096, Duration::from_secs(1));

    let deleted = fsutil::cleanup_directory(dir.path(), "mp4", None, None);
    assert_eq!(deleted, 1);
    assert!(!dir.path().join("tiny.mp4").exists());
    assert!(dir.path().join("fine.mp4").exists());
}

#[test]
fn test_clean_small_recordings() {
    let base = tmp_dir();
    let cam_dir = base.path().join("cam1");
    std::fs::create_dir_all(&cam_dir).expect("mkdir");

    // Incomplete fragment, far away in time from everything else.
    write_aged(&cam_dir.join("cam1_a.mp4"), 100 * 1024, Duration::from_secs(900));
    // Duplicate pair around one rotation boundary: only the largest stays.
    write_aged(&cam_dir.join("cam1_b.mp4"), 3 * 1024 * 1024, Duration::from_secs(62));
    write_aged(&cam_dir.join("cam1_c.mp4"), 2 * 1024 * 1024, Duration::from_secs(60));
    // Healthy lone recording.
    write_aged(&cam_dir.join("cam1_d.mp4"), 4 * 1024 * 1024, Duration::from_secs(300));

    let deleted = fsutil::clean_small_recordings(base.path(), 1024 * 1024);
    assert_eq!(deleted, 2);
    assert!(!cam_dir.join("cam1_a.mp4").exists(), "undersized fragment removed");
    assert!(cam_dir.join("cam1_b.mp4").exists(), "largest duplicate kept");
    assert!(!cam_dir.join("cam1_c.mp4").exists(), "smaller duplicate removed");
    assert!(cam_dir.join("cam1_d.mp4").exists());
}

#[test]
fn test_prune_segments_honors_playlist_and_age() {
    let dir = tmp_dir();
    let playlist = dir.path().join("cam1.m3u8");
    std::fs::write(
        &playlist,
        "#EXTM3U\n#EXT-X-VERSION:6\n#EXTINF:1.0,\ncam1-00002.ts\n#EXTINF:1.0,\ncam1-00003.ts\n",
    )
    .expect("playlist");

    // Old and unreferenced: eligible. Referenced or fresh: kept.
    write_aged(&dir.path().join("cam1-00001.ts"), 2048, Duration::from_secs(400));
    write_aged(&dir.path().join("cam1-00002.ts"), 2048, Duration::from_secs(400));
    write_aged(&dir.path().join("cam1-00003.ts"), 2048, Duration::from_secs(5));
    write_aged(&dir.path().join("cam1-00004.ts"), 2048, Duration::from_secs(5));

    let deleted = fsutil::prune_segments(dir.path(), &playlist, Duration::from_secs(180), false);
    assert_eq!(deleted, 1);
    assert!(!dir.path().join("cam1-00001.ts").exists());
    assert!(dir.path().join("cam1-00002.ts").exists(), "referenced segments stay");
    assert!(dir.path().join("cam1-00004.ts").exists(), "fresh orphans stay");
}

#[test]
fn test_prune_segments_without_playlist_needs_force() {
    let dir = tmp_dir();
    let playlist = dir.path().join("cam1.m3u8");
    write_aged(&dir.path().join("cam1-00001.ts"), 2048, Duration::from_secs(400));

    assert_eq!(
        fsutil::prune_segments(dir.path(), &playlist, Duration::from_secs(180), false),
        0
    );
    assert_eq!(
        fsutil::prune_segments(dir.path(), &playlist, Duration::from_secs(180), true),
        1
    );
}

#[test]
fn test_clear_stream_artifacts() {
    let tmp_root = tmp_dir();
    let cam_dir = tmp_root.path().join("cam1");
    std::fs::create_dir_all(&cam_dir).expect("mkdir");
    std::fs::write(cam_dir.join("cam1.m3u8"), "#EXTM3U\n").expect("write");
    std::fs::write(cam_dir.join("cam1-00001.ts"), "x").expect("write");
    std::fs::write(cam_dir.join("unrelated.txt"), "x").expect("write");

    assert_eq!(fsutil::clear_stream_artifacts(tmp_root.path()), 2);
    assert!(!cam_dir.join("cam1.m3u8").exists());
    assert!(!cam_dir.join("cam1-00001.ts").exists());
    assert!(cam_dir.join("unrelated.txt").exists());
}

// ──────────────── encoder driver ──────────────────────────────────────────

#[tokio::test]
async fn test_finalize_is_noop_for_missing_or_empty_input() {
    let dir = tmp_dir();
    let settings = Arc::new(Settings::defaults_at(dir.path().to_path_buf()));
    let driver = EncoderDriver::new(settings);

    // Missing file: nothing to do, no error.
    driver
        .finalize_mp4(&dir.path().join("absent.mp4"))
        .await
        .expect("missing input is a no-op");

    // Empty file: same.
    let empty = dir.path().join("empty.mp4");
    std::fs::write(&empty, b"").expect("write");
    driver.finalize_mp4(&empty).await.expect("empty input is a no-op");
    assert!(empty.exists(), "empty input is left in place");
}

// ──────────────── supervisor invariants ───────────────────────────────────

fn test_stack(dir: &Path, camera_lines: &str) -> (Arc<StreamingSupervisor>, Arc<RecordingSupervisor>) {
    let mut settings = Settings::defaults_at(dir.to_path_buf());
    settings.config_path = write_camera_file(dir, camera_lines);
    let settings = Arc::new(settings);
    let registry = Arc::new(CameraRegistry::new(settings.config_path.clone()));
    let encoder = Arc::new(EncoderDriver::new(settings.clone()));
    let resources = ResourceMonitor::new(settings.clone());
    let streaming =
        StreamingSupervisor::new(settings.clone(), registry.clone(), encoder.clone(), resources);
    let recording = RecordingSupervisor::new(settings, registry, encoder);
    (streaming, recording)
}

#[tokio::test]
async fn test_disabled_camera_is_refused() {
    let dir = tmp_dir();
    let (streaming, _) = test_stack(dir.path(), "cam3,Side,rtsp://x/3,0\n");

    let disabled = Camera {
        id: "cam3".into(),
        name: "Side".into(),
        rtsp_url: "rtsp://x/3".into(),
        enabled: false,
    };
    assert!(!streaming.get_or_start(&disabled));
    assert!(!streaming.has_session("cam3"));

    // Operator restart is refused too.
    assert!(matches!(
        streaming.restart_stream("cam3").await,
        Err(CamError::CameraDisabled { .. })
    ));
}

#[tokio::test]
async fn test_restart_unknown_camera_fails() {
    let dir = tmp_dir();
    let (streaming, _) = test_stack(dir.path(), "cam1,Front,rtsp://x/1,1\n");
    assert!(matches!(
        streaming.restart_stream("ghost").await,
        Err(CamError::CameraNotFound { .. })
    ));
}

#[tokio::test]
async fn test_stop_without_session_reports_no_session() {
    let dir = tmp_dir();
    let (streaming, recording) = test_stack(dir.path(), "cam1,Front,rtsp://x/1,1\n");
    assert!(matches!(
        streaming.stop_stream("cam1").await,
        Err(CamError::NoActiveSession { .. })
    ));
    assert!(matches!(
        recording.stop_recording("cam1").await,
        Err(CamError::NoActiveSession { .. })
    ));
}

#[tokio::test]
async fn test_stop_all_leaves_empty_tables() {
    let dir = tmp_dir();
    let (streaming, recording) = test_stack(dir.path(), "cam1,Front,rtsp://x/1,1\n");

    streaming.stop_all().await;
    assert_eq!(streaming.active_count(), 0);
    assert!(streaming.active_camera_ids().is_empty());
    let (active, sessions) = streaming.status();
    assert_eq!(active, 0);
    assert!(sessions.is_empty());

    assert!(recording.stop_all().await);
    assert_eq!(recording.active_count(), 0);
    assert!(recording.status().is_empty());
}

#[test]
fn test_restart_backoff_escalation() {
    let cooldown = Duration::from_secs(30);

    // Within budget: no extra cooldown.
    for count in 0..=5 {
        assert_eq!(restart_backoff(count, 5, cooldown), None);
    }
    // Just past the budget: cooldown x (count - max + 1).
    assert_eq!(restart_backoff(6, 5, cooldown), Some(Duration::from_secs(60)));
    assert_eq!(restart_backoff(10, 5, cooldown), Some(Duration::from_secs(180)));
    // Capped at five minutes.
    assert_eq!(restart_backoff(40, 5, cooldown), Some(Duration::from_secs(300)));
}

// ──────────────── recording grooming settings ─────────────────────────────

#[test]
fn test_groom_recordings_uses_age_horizon() {
    let dir = tmp_dir();
    let settings = Settings::defaults_at(dir.path().to_path_buf());
    let cam_dir = settings.record_path.join("cam1");
    std::fs::create_dir_all(&cam_dir).expect("mkdir");

    let eight_days = Duration::from_secs(8 * 24 * 3600);
    write_aged(&cam_dir.join("cam1_old.mp4"), 2048, eight_days);
    write_aged(&cam_dir.join("cam1_new.mp4"), 2048, Duration::from_secs(60));

    let deleted = camwatch::cleanup::groom_recordings(&settings);
    assert_eq!(deleted, 1);
    assert!(!cam_dir.join("cam1_old.mp4").exists());
    assert!(cam_dir.join("cam1_new.mp4").exists());
}
