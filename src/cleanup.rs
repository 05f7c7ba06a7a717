// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Cleanup scheduler.
//!
//! A slow loop that grooms HLS segments for every active streaming session,
//! escalating to an extra pass when the tmp volume runs low, plus the one-shot
//! grooming passes used at startup and by the recording-cleanup control op.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Settings;
use crate::fsutil;
use crate::streaming::StreamingSupervisor;

/// Free space on the tmp volume below which grooming turns aggressive.
const TMP_MIN_FREE_GB: u64 = 2;

/// Periodic segment grooming; runs forever.
pub async fn run(settings: Arc<Settings>, streaming: Arc<StreamingSupervisor>) {
    info!(
        interval_secs = settings.cleanup_interval.as_secs(),
        "Cleanup scheduler started"
    );
    loop {
        sleep(settings.cleanup_interval).await;
        groom_segments(&settings, &streaming);

        if !fsutil::has_free_space(&settings.tmp_path, TMP_MIN_FREE_GB) {
            warn!("Tmp volume low, running aggressive segment cleanup");
            groom_segments(&settings, &streaming);
        }
    }
}

fn groom_segments(settings: &Settings, streaming: &StreamingSupervisor) {
    let mut deleted = 0;
    for camera_id in streaming.active_camera_ids() {
        deleted += fsutil::prune_segments(
            &settings.camera_tmp_dir(&camera_id),
            &settings.playlist_path(&camera_id),
            settings.hls_segment_max_age,
            false,
        );
    }
    if deleted > 0 {
        info!(deleted, "Scheduled segment cleanup finished");
    }
}

/// One-shot grooming of old recordings: age horizon plus a per-camera cap,
/// applied to the record root and (7x the horizon, tighter cap) the backup
/// root. Returns the number of deleted files.
pub fn groom_recordings(settings: &Settings) -> usize {
    let horizon = Duration::from_secs(settings.recording_max_age_days * 24 * 3600);
    let mut deleted = 0;

    if let Ok(camera_dirs) = std::fs::read_dir(&settings.record_path) {
        for camera_dir in camera_dirs.flatten() {
            if camera_dir.path().is_dir() {
                deleted += fsutil::cleanup_directory(
                    &camera_dir.path(),
                    "mp4",
                    Some(horizon),
                    Some(settings.max_recordings_per_camera),
                );
            }
        }
    }

    if let Ok(camera_dirs) = std::fs::read_dir(&settings.backup_path) {
        for camera_dir in camera_dirs.flatten() {
            if camera_dir.path().is_dir() {
                deleted += fsutil::cleanup_directory(
                    &camera_dir.path(),
                    "mp4",
                    Some(horizon * 7),
                    Some(50),
                );
            }
        }
    }

    info!(deleted, "Recording grooming finished");
    deleted
}

/// Startup hygiene: drop stream artifacts from a previous run and thin the
/// log directory.
pub fn cold_boot(settings: &Settings) {
    fsutil::clear_stream_artifacts(&settings.tmp_path);
    let removed_logs = fsutil::cleanup_directory(
        &settings.log_path,
        "log",
        Some(Duration::from_secs(30 * 24 * 3600)),
        Some(50),
    );
    if removed_logs > 0 {
        info!(removed_logs, "Old log files removed");
    }
}
