// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Recording supervisor.
//!
//! Recordings start on operator command only. Each one is a single encoder
//! child writing a timestamped MP4; a 200 ms rotation monitor slices the
//! output at the configured boundary, a stderr reader keeps the encoder's
//! complaints in our logs, a 30 s monitor restarts exited children with
//! exponential backoff, and a 60 s self-heal loop catches the slower failure
//! modes (zombies, frozen output files, stale directories, leftover temp
//! files).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::cameras::{redact_credentials, CameraRegistry};
use crate::config::Settings;
use crate::encoder::{pid_exists, EncoderDriver, RecordSource};
use crate::error::{CamError, Result};
use crate::fsutil;

/// Overall budget for one termination ladder run.
const TERMINATE_BUDGET: Duration = Duration::from_secs(10);
/// Output below this size is an incomplete recording.
const MIN_RECORDING_BYTES: u64 = 1024 * 1024;
/// Rotation boundary poll cadence.
const ROTATION_POLL: Duration = Duration::from_millis(200);
/// Exited-child monitor cadence.
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);
/// Self-heal sweep cadence.
const SELF_HEAL_INTERVAL: Duration = Duration::from_secs(60);
/// Backoff bounds for the exited-child monitor.
const MIN_RESTART_BACKOFF: Duration = Duration::from_secs(5);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(300);

/// Timestamped output path: `<dir>/<id>_YYYYMMDDHHMMSS.mp4`.
pub fn record_file_path(record_dir: &Path, camera_id: &str, now: DateTime<Local>) -> PathBuf {
    record_dir.join(format!("{camera_id}_{}.mp4", now.format("%Y%m%d%H%M%S")))
}

/// One active MP4 writer.
struct RecordingSession {
    token: u64,
    pid: Option<u32>,
    child: Arc<tokio::sync::Mutex<Child>>,
    source: RecordSource,
    /// Operator-supplied URL, kept for rotations and self-heal restarts.
    rtsp_url: String,
    output_path: PathBuf,
    started_at: DateTime<Local>,
    started_instant: Instant,
}

#[derive(Default)]
struct RecordingTables {
    sessions: HashMap<String, RecordingSession>,
}

/// Snapshot of one recording for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatus {
    pub camera_id: String,
    pub pid: Option<u32>,
    pub output_path: String,
    pub source: String,
    pub started_at: String,
}

struct Installed {
    token: u64,
    stderr: Option<ChildStderr>,
    replaced: Option<Arc<tokio::sync::Mutex<Child>>>,
}

pub struct RecordingSupervisor {
    settings: Arc<Settings>,
    registry: Arc<CameraRegistry>,
    encoder: Arc<EncoderDriver>,
    tables: Mutex<RecordingTables>,
    session_seq: AtomicU64,
}

impl RecordingSupervisor {
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<CameraRegistry>,
        encoder: Arc<EncoderDriver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            registry,
            encoder,
            tables: Mutex::new(RecordingTables::default()),
            session_seq: AtomicU64::new(1),
        })
    }

    /// Spawn the long-lived watchers: exited-child monitor and self-heal.
    pub fn spawn_monitors(self: Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.monitor_exited().await });
        let this = self.clone();
        tokio::spawn(async move { this.self_heal().await });
    }

    pub fn has_session(&self, camera_id: &str) -> bool {
        self.tables.lock().sessions.contains_key(camera_id)
    }

    pub fn active_count(&self) -> usize {
        self.tables.lock().sessions.len()
    }

    /// Status snapshot for the control surface.
    pub fn status(&self) -> Vec<RecordingStatus> {
        let tables = self.tables.lock();
        let mut sessions: Vec<RecordingStatus> = tables
            .sessions
            .iter()
            .map(|(id, session)| RecordingStatus {
                camera_id: id.clone(),
                pid: session.pid,
                output_path: session.output_path.display().to_string(),
                source: if session.source.is_local_hls() {
                    "hls".into()
                } else {
                    "rtsp".into()
                },
                started_at: session.started_at.to_rfc3339(),
            })
            .collect();
        sessions.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        sessions
    }

    // ──────────────── start / stop ────────────────────────────────────────

    /// Start recording one camera. Any existing session is stopped first;
    /// disk space and RTSP reachability gate the launch.
    pub async fn start_recording(self: Arc<Self>, camera_id: &str, rtsp_url: &str) -> Result<()> {
        info!(
            camera = camera_id,
            url = redact_credentials(rtsp_url),
            "Starting recording"
        );

        if self.has_session(camera_id) {
            info!(camera = camera_id, "Stopping existing recording first");
            let _ = self.stop_recording(camera_id).await;
            sleep(Duration::from_secs(3)).await;
        }

        let record_dir = self.settings.camera_record_dir(camera_id);
        fsutil::ensure_directory(&record_dir)?;

        let available_gb = fsutil::free_space_gb(&record_dir);
        if available_gb < self.settings.min_disk_space_gb as f64 {
            return Err(CamError::DiskSpace {
                path: record_dir.display().to_string(),
                available_gb,
                required_gb: self.settings.min_disk_space_gb,
            });
        }

        // The source must answer before we commit to a session.
        let mut last_reason = String::new();
        let mut reachable = false;
        for attempt in 1..=self.settings.retry_attempts {
            match self
                .encoder
                .probe_rtsp(rtsp_url, self.settings.rtsp_timeout)
                .await
            {
                Ok(()) => {
                    reachable = true;
                    break;
                }
                Err(reason) => {
                    warn!(camera = camera_id, attempt, reason, "RTSP probe failed");
                    // Permission-style refusals tend to clear slower than
                    // plain connect failures.
                    let delay = if reason.contains("Operation not permitted") {
                        self.settings.max_retry_delay
                    } else {
                        self.settings.retry_delay
                    };
                    last_reason = reason;
                    if attempt < self.settings.retry_attempts {
                        sleep(delay).await;
                    }
                }
            }
        }
        if !reachable {
            return Err(CamError::RtspUnreachable {
                url: redact_credentials(rtsp_url),
                reason: last_reason,
            });
        }

        let source = self.encoder.choose_record_source(camera_id, rtsp_url).await;
        let output_path = record_file_path(&record_dir, camera_id, Local::now());
        let args = self.encoder.record_command(&source, &output_path);
        let mut child = self.encoder.start(&args, None, false)?;
        let mut stderr = child.stderr.take();

        // Immediate-death check before the session is published.
        sleep(Duration::from_secs(1)).await;
        if let Ok(Some(status)) = child.try_wait() {
            let mut diagnostics = String::new();
            if let Some(mut pipe) = stderr.take() {
                let _ = pipe.read_to_string(&mut diagnostics).await;
            }
            error!(
                camera = camera_id,
                status = %status,
                diagnostics = diagnostics,
                "Recording encoder exited at startup"
            );
            return Err(CamError::Encoder(format!(
                "recording encoder exited with {status} at startup"
            )));
        }

        let installed = self.install_session(
            camera_id,
            child,
            stderr,
            source,
            rtsp_url.to_string(),
            output_path.clone(),
        );
        if let Some(old_child) = installed.replaced {
            warn!(camera = camera_id, "Replacing concurrent recording session");
            let mut guard = old_child.lock().await;
            let _ = self.encoder.terminate(&mut guard, TERMINATE_BUDGET).await;
        }
        self.clone()
            .spawn_session_monitors(camera_id, installed.token, installed.stderr);

        info!(
            camera = camera_id,
            path = %output_path.display(),
            "Recording started"
        );
        Ok(())
    }

    /// Stop one camera's recording, reap the child and triage the output:
    /// empty or undersized files are discarded, complete ones finalized.
    pub async fn stop_recording(&self, camera_id: &str) -> Result<()> {
        let session = self
            .tables
            .lock()
            .sessions
            .remove(camera_id)
            .ok_or_else(|| CamError::NoActiveSession {
                id: camera_id.to_string(),
            })?;

        info!(
            camera = camera_id,
            path = %session.output_path.display(),
            "Stopping recording"
        );
        {
            let mut child = session.child.lock().await;
            if !self.encoder.terminate(&mut child, TERMINATE_BUDGET).await {
                error!(camera = camera_id, "Recording child survived termination");
            }
        }
        self.triage_output(&session.output_path).await;
        Ok(())
    }

    async fn triage_output(&self, path: &Path) {
        match std::fs::metadata(path) {
            Err(_) => error!(path = %path.display(), "Recording file missing"),
            Ok(meta) if meta.len() == 0 => {
                warn!(path = %path.display(), "Discarding empty recording");
                let _ = std::fs::remove_file(path);
            }
            Ok(meta) if meta.len() < MIN_RECORDING_BYTES => {
                warn!(
                    path = %path.display(),
                    bytes = meta.len(),
                    "Discarding incomplete recording"
                );
                let _ = std::fs::remove_file(path);
            }
            Ok(_) => {
                if let Err(e) = self.encoder.finalize_mp4(path).await {
                    error!(path = %path.display(), error = %e, "Finalize failed");
                }
            }
        }
    }

    // ──────────────── start-all / stop-all ────────────────────────────────

    /// Stop everything, wait for the dust to settle, then launch every
    /// enabled camera with one retry pass for the stragglers.
    pub async fn start_all(self: Arc<Self>) -> bool {
        info!("Starting recordings for all enabled cameras");
        self.stop_all().await;
        sleep(Duration::from_secs(8)).await;

        if !self.tables.lock().sessions.is_empty() {
            warn!("Recording sessions survived stop-all, escalating");
            self.encoder.kill_all(None);
            self.tables.lock().sessions.clear();
            sleep(Duration::from_secs(2)).await;
        }

        let cameras = match self.registry.enabled_cameras() {
            Ok(cameras) => cameras,
            Err(e) => {
                error!(error = %e, "Cannot read camera list");
                return false;
            }
        };

        let mut failed = Vec::new();
        for camera in &cameras {
            if let Err(e) = self
                .clone()
                .start_recording(&camera.id, &camera.rtsp_url)
                .await
            {
                error!(camera = camera.id, error = %e, "Recording start failed");
                failed.push(camera.clone());
            }
        }

        if failed.is_empty() {
            info!(cameras = cameras.len(), "All recordings started");
            return true;
        }

        info!(retrying = failed.len(), "Retrying failed recordings");
        sleep(Duration::from_secs(5)).await;
        let mut unrecovered = Vec::new();
        for camera in failed {
            if self.has_session(&camera.id) {
                continue;
            }
            if let Err(e) = self
                .clone()
                .start_recording(&camera.id, &camera.rtsp_url)
                .await
            {
                error!(camera = camera.id, error = %e, "Recording retry failed");
                unrecovered.push(camera.id);
            }
        }

        if unrecovered.is_empty() {
            info!("All recordings started after retry");
            true
        } else {
            warn!(cameras = unrecovered.join(", "), "Recordings not started");
            false
        }
    }

    /// Stop every recording, force out stragglers, clear the tables, and
    /// confirm no encoder survived.
    pub async fn stop_all(&self) -> bool {
        let camera_ids: Vec<String> = self.tables.lock().sessions.keys().cloned().collect();
        if camera_ids.is_empty() {
            info!("No recordings to stop");
            return true;
        }
        info!(cameras = camera_ids.len(), "Stopping all recordings");

        let mut ok = true;
        for camera_id in &camera_ids {
            match self.stop_recording(camera_id).await {
                Ok(()) | Err(CamError::NoActiveSession { .. }) => {}
                Err(e) => {
                    warn!(camera = camera_id, error = %e, "Recording stop failed");
                    ok = false;
                }
            }
        }

        self.encoder.kill_all(None);
        {
            let mut tables = self.tables.lock();
            tables.sessions.clear();
        }

        if self.encoder.any_encoder_alive() {
            warn!("Encoder processes still alive after stop-all");
        } else {
            info!("All recordings stopped, no encoder processes left");
        }
        ok
    }

    // ──────────────── session plumbing ────────────────────────────────────

    fn install_session(
        &self,
        camera_id: &str,
        mut child: Child,
        stderr: Option<ChildStderr>,
        source: RecordSource,
        rtsp_url: String,
        output_path: PathBuf,
    ) -> Installed {
        let token = self.session_seq.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let stderr = stderr.or_else(|| child.stderr.take());
        let child = Arc::new(tokio::sync::Mutex::new(child));

        let replaced = {
            let mut tables = self.tables.lock();
            tables
                .sessions
                .insert(
                    camera_id.to_string(),
                    RecordingSession {
                        token,
                        pid,
                        child,
                        source,
                        rtsp_url,
                        output_path,
                        started_at: Local::now(),
                        started_instant: Instant::now(),
                    },
                )
                .map(|old| old.child)
        };
        Installed {
            token,
            stderr,
            replaced,
        }
    }

    fn spawn_session_monitors(
        self: Arc<Self>,
        camera_id: &str,
        token: u64,
        stderr: Option<ChildStderr>,
    ) {
        if let Some(stderr) = stderr {
            let id = camera_id.to_string();
            tokio::spawn(async move { monitor_encoder_output(id, stderr).await });
        }
        let this = self.clone();
        let id = camera_id.to_string();
        tokio::spawn(async move { this.rotation_monitor(id, token).await });
    }

    // ──────────────── rotation ────────────────────────────────────────────

    /// Watch one session's elapsed time and rotate at the boundary. The fine
    /// poll keeps the cut close to the configured slice length.
    async fn rotation_monitor(self: Arc<Self>, camera_id: String, token: u64) {
        debug!(camera = camera_id, "Rotation monitor started");
        let slice = self.settings.max_recording_duration();
        loop {
            sleep(ROTATION_POLL).await;
            let elapsed = {
                let tables = self.tables.lock();
                tables
                    .sessions
                    .get(&camera_id)
                    .filter(|s| s.token == token)
                    .map(|s| s.started_instant.elapsed())
            };
            let Some(elapsed) = elapsed else {
                debug!(camera = camera_id, "Session gone, rotation monitor exiting");
                return;
            };
            if elapsed >= slice {
                info!(
                    camera = camera_id,
                    elapsed_secs = elapsed.as_secs(),
                    "Recording reached its time slice, rotating"
                );
                self.clone().rotate(&camera_id, token).await;
                return;
            }
        }
    }

    /// Stop the finished slice, triage it, and start the replacement child.
    /// Rotations always read RTSP directly. The replacement gets its own
    /// monitors; the session map holds the old or the new entry, never both.
    async fn rotate(self: Arc<Self>, camera_id: &str, token: u64) {
        let session = {
            let mut tables = self.tables.lock();
            let matches = tables
                .sessions
                .get(camera_id)
                .map(|s| s.token == token)
                .unwrap_or(false);
            if matches {
                tables.sessions.remove(camera_id)
            } else {
                None
            }
        };
        let Some(session) = session else {
            return;
        };

        {
            let mut child = session.child.lock().await;
            let _ = self.encoder.terminate(&mut child, TERMINATE_BUDGET).await;
        }
        self.triage_output(&session.output_path).await;

        let rtsp_url = session.rtsp_url.clone();
        let has_audio = self
            .encoder
            .probe_audio(&rtsp_url, self.settings.rtsp_timeout)
            .await;
        let record_dir = self.settings.camera_record_dir(camera_id);

        for attempt in 1..=self.settings.retry_attempts {
            let output_path = record_file_path(&record_dir, camera_id, Local::now());
            let args = self
                .encoder
                .rotation_command(&rtsp_url, &output_path, has_audio);
            match self.encoder.start(&args, None, false) {
                Ok(mut child) => {
                    let stderr = child.stderr.take();
                    sleep(Duration::from_millis(500)).await;
                    if let Ok(Some(status)) = child.try_wait() {
                        error!(
                            camera = camera_id,
                            attempt,
                            status = %status,
                            "Rotation encoder exited at startup"
                        );
                        sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                    let installed = self.install_session(
                        camera_id,
                        child,
                        stderr,
                        RecordSource::Rtsp {
                            url: rtsp_url.clone(),
                        },
                        rtsp_url.clone(),
                        output_path.clone(),
                    );
                    if let Some(old_child) = installed.replaced {
                        let mut guard = old_child.lock().await;
                        let _ = self.encoder.terminate(&mut guard, TERMINATE_BUDGET).await;
                    }
                    self.clone()
                        .spawn_session_monitors(camera_id, installed.token, installed.stderr);
                    info!(
                        camera = camera_id,
                        path = %output_path.display(),
                        "Recording rotated"
                    );
                    return;
                }
                Err(e) => {
                    error!(camera = camera_id, attempt, error = %e, "Rotation start failed");
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
        error!(
            camera = camera_id,
            "Could not start a replacement recording after rotation"
        );
    }

    // ──────────────── watchers ────────────────────────────────────────────

    /// Restart recordings whose child exited, with exponential backoff that
    /// resets on success. Only cameras still enabled in the registry are
    /// restarted automatically.
    async fn monitor_exited(self: Arc<Self>) {
        info!("Recording monitor started");
        let mut backoff: HashMap<String, Duration> = HashMap::new();

        loop {
            sleep(MONITOR_INTERVAL).await;

            let enabled: std::collections::HashSet<String> = match self.registry.enabled_cameras()
            {
                Ok(cameras) => cameras.into_iter().map(|c| c.id).collect(),
                Err(e) => {
                    error!(error = %e, "Cannot read camera list");
                    continue;
                }
            };

            let snapshot: Vec<(String, Arc<tokio::sync::Mutex<Child>>, String)> = {
                let tables = self.tables.lock();
                tables
                    .sessions
                    .iter()
                    .filter(|(id, _)| enabled.contains(*id))
                    .map(|(id, s)| (id.clone(), s.child.clone(), s.rtsp_url.clone()))
                    .collect()
            };

            for (camera_id, child, rtsp_url) in snapshot {
                let exited = {
                    let mut guard = child.lock().await;
                    matches!(guard.try_wait(), Ok(Some(_)))
                };
                if !exited {
                    backoff.remove(&camera_id);
                    continue;
                }

                let delay = *backoff.entry(camera_id.clone()).or_insert(MIN_RESTART_BACKOFF);
                warn!(
                    camera = camera_id,
                    delay_secs = delay.as_secs(),
                    "Recording encoder exited, restarting after backoff"
                );
                sleep(delay).await;
                backoff.insert(camera_id.clone(), (delay * 2).min(MAX_RESTART_BACKOFF));

                let _ = self.stop_recording(&camera_id).await;
                sleep(Duration::from_secs(2)).await;
                match self.clone().start_recording(&camera_id, &rtsp_url).await {
                    Ok(()) => {
                        info!(camera = camera_id, "Recording restarted");
                        backoff.insert(camera_id.clone(), MIN_RESTART_BACKOFF);
                    }
                    Err(e) => {
                        warn!(camera = camera_id, error = %e, "Recording restart failed");
                    }
                }
            }
        }
    }

    /// Slow sweep for the failure modes the fast monitors miss.
    async fn self_heal(self: Arc<Self>) {
        info!("Recording self-heal loop started");
        let mut anomaly_counts: HashMap<String, u32> = HashMap::new();

        loop {
            sleep(SELF_HEAL_INTERVAL).await;
            let stale_budget =
                Duration::from_secs((self.settings.max_recording_minutes + 2) * 60);

            let snapshot: Vec<(
                String,
                Arc<tokio::sync::Mutex<Child>>,
                Option<u32>,
                PathBuf,
                String,
            )> = {
                let tables = self.tables.lock();
                tables
                    .sessions
                    .iter()
                    .map(|(id, s)| {
                        (
                            id.clone(),
                            s.child.clone(),
                            s.pid,
                            s.output_path.clone(),
                            s.rtsp_url.clone(),
                        )
                    })
                    .collect()
            };

            for (camera_id, child, pid, output_path, rtsp_url) in snapshot {
                let record_dir = output_path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.settings.camera_record_dir(&camera_id));

                // Leftover finalize temporaries are safe to drop any time.
                remove_temp_files(&record_dir);

                let exited = {
                    let mut guard = child.lock().await;
                    matches!(guard.try_wait(), Ok(Some(_)))
                } || pid.map(|p| !pid_exists(p)).unwrap_or(false);

                let anomaly = if exited {
                    Some("process_zombie")
                } else if file_older_than(&output_path, stale_budget) {
                    Some("file_no_update")
                } else if newest_recording_mtime(&record_dir)
                    .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                    .map(|age| age > stale_budget)
                    .unwrap_or(false)
                {
                    Some("dir_no_new_mp4")
                } else {
                    None
                };

                let Some(kind) = anomaly else {
                    anomaly_counts.remove(&camera_id);
                    continue;
                };

                error!(camera = camera_id, kind, "Recording anomaly, forcing recovery");
                let count = anomaly_counts
                    .entry(camera_id.clone())
                    .and_modify(|c| *c += 1)
                    .or_insert(1);
                self.dump_anomaly(&camera_id, kind, &output_path);

                let repeat_offender = *count >= 3;

                let _ = self.stop_recording(&camera_id).await;
                sleep(Duration::from_secs(2)).await;
                let url = self
                    .registry
                    .get(&camera_id)
                    .map(|c| c.rtsp_url)
                    .unwrap_or(rtsp_url);
                if let Err(e) = self.clone().start_recording(&camera_id, &url).await {
                    warn!(camera = camera_id, error = %e, "Self-heal restart failed");
                }

                if repeat_offender {
                    error!(
                        camera = camera_id,
                        "Repeated recording anomalies, backing off"
                    );
                    sleep(Duration::from_secs(120)).await;
                    anomaly_counts.insert(camera_id, 0);
                }
            }
        }
    }

    /// Persist a diagnostic snapshot for a self-heal anomaly.
    fn dump_anomaly(&self, camera_id: &str, kind: &str, output_path: &Path) {
        use std::io::Write;
        let dump_dir = self.settings.log_path.join("self_heal");
        if std::fs::create_dir_all(&dump_dir).is_err() {
            return;
        }
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let dump_path = dump_dir.join(format!("{camera_id}_{kind}_{stamp}.log"));
        let Ok(mut file) = std::fs::File::create(&dump_path) else {
            return;
        };
        let _ = writeln!(file, "camera_id: {camera_id}");
        let _ = writeln!(file, "anomaly: {kind}");
        let _ = writeln!(file, "file_path: {}", output_path.display());
        let _ = writeln!(file, "datetime: {}", Local::now());
        if let Ok(meta) = std::fs::metadata(output_path) {
            let _ = writeln!(file, "file_size: {}", meta.len());
            if let Ok(mtime) = meta.modified() {
                let _ = writeln!(file, "last_update: {:?}", mtime);
            }
        }
    }
}

/// Read the encoder's stderr line by line. Transient network noise is
/// tolerated; genuine error bursts are surfaced for the monitors to act on.
async fn monitor_encoder_output(camera_id: String, stderr: ChildStderr) {
    const TRANSIENT: [&str; 8] = [
        "Operation not permitted",
        "Connection refused",
        "timeout",
        "Network is unreachable",
        "Invalid data",
        "End of file",
        "Connection reset by peer",
        "Protocol error",
    ];

    debug!(camera = camera_id, "Encoder output monitor started");
    let mut lines = BufReader::new(stderr).lines();
    let mut error_count: i32 = 0;

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.to_lowercase().contains("error") {
            error_count += 1;
            warn!(camera = camera_id, line, "Encoder error output");
            if TRANSIENT.iter().any(|t| line.contains(t)) {
                error_count = (error_count - 1).max(0);
            }
            if line.contains("Conversion failed!") || line.contains("Invalid argument") {
                error!(camera = camera_id, line, "Fatal encoder error");
                error_count += 5;
            }
            if error_count > 15 {
                error!(
                    camera = camera_id,
                    "Encoder error burst; recovery left to the session monitors"
                );
                error_count = 0;
            }
        } else {
            if line.contains("frame=") && line.contains("time=") {
                error_count = (error_count - 1).max(0);
            }
            debug!(camera = camera_id, line, "Encoder output");
        }
    }
    debug!(camera = camera_id, "Encoder output monitor finished");
}

fn file_older_than(path: &Path, limit: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .map(|age| age > limit)
        .unwrap_or(false)
}

/// Mtime of the newest finished recording in the directory, ignoring
/// finalize temporaries.
fn newest_recording_mtime(record_dir: &Path) -> Option<SystemTime> {
    let entries = std::fs::read_dir(record_dir).ok()?;
    entries
        .flatten()
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.ends_with(".mp4") && !name.ends_with(".temp.mp4")
        })
        .filter_map(|entry| entry.metadata().ok()?.modified().ok())
        .max()
}

fn remove_temp_files(record_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(record_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path
            .file_name()
            .map(|n| n.to_string_lossy().ends_with(".temp.mp4"))
            .unwrap_or(false)
        {
            if std::fs::remove_file(&path).is_ok() {
                info!(path = %path.display(), "Removed stale finalize temporary");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn record_path_embeds_timestamp() {
        let now = Local.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        let path = record_file_path(Path::new("/rec/cam1"), "cam1", now);
        assert_eq!(path, Path::new("/rec/cam1/cam1_20260314150926.mp4"));
    }

    #[test]
    fn stale_file_detection_tolerates_missing_files() {
        assert!(!file_older_than(
            Path::new("/definitely/not/here.mp4"),
            Duration::from_secs(1)
        ));
    }
}
