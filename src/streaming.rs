// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Streaming supervisor.
//!
//! Owns the admission queue, the fixed worker pool, and the per-camera live
//! HLS sessions. Every enabled camera gets at most one session; each session
//! is watched by two monitors (child liveness, playlist freshness), and a
//! global sweep catches whatever the per-session monitors miss.
//!
//! ```text
//! enqueue ──→ queue ──→ worker pool ──→ launch ──→ session table
//!                                                     │
//!                     restart ledger ◂── monitors ◂───┘
//! ```
//!
//! All tables live behind one mutex which is never held across an await;
//! child handles are parked in their own async mutex so termination can block
//! without starving readers.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::Local;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::cameras::{redact_credentials, Camera, CameraRegistry};
use crate::config::Settings;
use crate::encoder::{read_log_tail, EncoderDriver};
use crate::error::{CamError, Result};
use crate::fsutil;
use crate::resources::ResourceMonitor;

/// With no restart in this window, a camera's restart counter is forgiven.
const RESTART_QUIET_WINDOW: Duration = Duration::from_secs(300);
/// Hard cap on the escalated restart cooldown.
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(300);
/// Overall budget for one termination ladder run.
const TERMINATE_BUDGET: Duration = Duration::from_secs(10);
/// How long a launch waits for the first playable playlist.
const PLAYLIST_WAIT: Duration = Duration::from_secs(30);

/// Extra cooldown applied once a camera exceeds the restart budget; capped.
pub fn restart_backoff(count: u32, max_count: u32, cooldown: Duration) -> Option<Duration> {
    if count <= max_count {
        return None;
    }
    Some(cooldown.saturating_mul(count - max_count + 1).min(MAX_RESTART_BACKOFF))
}

/// One live HLS transcode.
struct StreamSession {
    /// Generation token; monitors exit when the table entry stops matching.
    token: u64,
    pid: Option<u32>,
    child: Arc<tokio::sync::Mutex<Child>>,
    rtsp_url: String,
    started_at: Instant,
    /// Last observed playlist size in bytes.
    playlist_size: u64,
    /// Last observed mtime of the newest segment.
    last_segment_mtime: Option<SystemTime>,
}

struct RestartEntry {
    count: u32,
    last_attempt: Instant,
}

#[derive(Default)]
struct StreamingTables {
    sessions: HashMap<String, StreamSession>,
    active: usize,
    restarts: HashMap<String, RestartEntry>,
    /// Cameras currently inside the launch sequence; keeps the queue and the
    /// global sweep from piling a second launch onto the playlist wait.
    launching: HashSet<String>,
}

impl Default for RestartEntry {
    fn default() -> Self {
        Self {
            count: 0,
            last_attempt: Instant::now(),
        }
    }
}

/// Snapshot of one session for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub camera_id: String,
    pub pid: Option<u32>,
    pub uptime_secs: u64,
    pub playlist_size: u64,
    pub restart_count: u32,
}

pub struct StreamingSupervisor {
    settings: Arc<Settings>,
    registry: Arc<CameraRegistry>,
    encoder: Arc<EncoderDriver>,
    resources: Arc<ResourceMonitor>,
    tables: Mutex<StreamingTables>,
    queue_tx: mpsc::UnboundedSender<Camera>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Camera>>,
    session_seq: AtomicU64,
}

impl StreamingSupervisor {
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<CameraRegistry>,
        encoder: Arc<EncoderDriver>,
        resources: Arc<ResourceMonitor>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            settings,
            registry,
            encoder,
            resources,
            tables: Mutex::new(StreamingTables::default()),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            session_seq: AtomicU64::new(1),
        })
    }

    /// Spawn the worker pool and the global health monitor.
    pub fn spawn_workers(self: Arc<Self>) {
        for worker_id in 0..self.settings.max_concurrent_streams {
            let this = self.clone();
            tokio::spawn(async move { this.worker(worker_id).await });
        }
        let this = self.clone();
        tokio::spawn(async move { this.global_health_monitor().await });
        info!(
            workers = self.settings.max_concurrent_streams,
            "Streaming workers started"
        );
    }

    // ──────────────── public surface ──────────────────────────────────────

    /// Queue a camera for streaming. Disabled cameras are refused; a camera
    /// that already has a session or launch underway is acknowledged without
    /// queueing.
    pub fn get_or_start(&self, camera: &Camera) -> bool {
        if !self.registry.streaming_allowed(camera) {
            info!(camera = camera.id, "Camera disabled, not streaming");
            return false;
        }
        if self.session_or_launch_pending(&camera.id) {
            return true;
        }
        self.queue_tx.send(camera.clone()).is_ok()
    }

    pub fn has_session(&self, camera_id: &str) -> bool {
        self.tables.lock().sessions.contains_key(camera_id)
    }

    fn session_or_launch_pending(&self, camera_id: &str) -> bool {
        let tables = self.tables.lock();
        tables.sessions.contains_key(camera_id) || tables.launching.contains(camera_id)
    }

    pub fn active_count(&self) -> usize {
        self.tables.lock().active
    }

    pub fn active_camera_ids(&self) -> Vec<String> {
        self.tables.lock().sessions.keys().cloned().collect()
    }

    /// Status snapshot for the control surface.
    pub fn status(&self) -> (usize, Vec<StreamStatus>) {
        let tables = self.tables.lock();
        let mut sessions: Vec<StreamStatus> = tables
            .sessions
            .iter()
            .map(|(id, session)| StreamStatus {
                camera_id: id.clone(),
                pid: session.pid,
                uptime_secs: session.started_at.elapsed().as_secs(),
                playlist_size: session.playlist_size,
                restart_count: tables.restarts.get(id).map(|e| e.count).unwrap_or(0),
            })
            .collect();
        sessions.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        (tables.active, sessions)
    }

    /// Restart one camera's stream: bump the ledger, honor the escalated
    /// cooldown, tear the old session down and re-queue the camera.
    pub async fn restart_stream(&self, camera_id: &str) -> Result<()> {
        let count = {
            let mut tables = self.tables.lock();
            let entry = tables.restarts.entry(camera_id.to_string()).or_default();
            if entry.last_attempt.elapsed() > RESTART_QUIET_WINDOW {
                entry.count = 0;
            }
            entry.count += 1;
            entry.last_attempt = Instant::now();
            entry.count
        };
        info!(camera = camera_id, attempt = count, "Restarting stream");

        if let Some(backoff) = restart_backoff(
            count,
            self.settings.max_restart_count,
            self.settings.restart_cooldown,
        ) {
            warn!(
                camera = camera_id,
                attempt = count,
                backoff_secs = backoff.as_secs(),
                "Restart budget exhausted, cooling down"
            );
            sleep(backoff).await;
            let mut tables = self.tables.lock();
            if let Some(entry) = tables.restarts.get_mut(camera_id) {
                entry.count = 1;
            }
        }

        let old_child = {
            let mut tables = self.tables.lock();
            tables.sessions.remove(camera_id).map(|session| {
                tables.active = tables.active.saturating_sub(1);
                session.child
            })
        };
        if let Some(child) = old_child {
            let mut guard = child.lock().await;
            let _ = self.encoder.terminate(&mut guard, TERMINATE_BUDGET).await;
        }
        self.encoder.kill_all(Some(camera_id));

        let camera = self.registry.get(camera_id)?;
        if !self.registry.streaming_allowed(&camera) {
            info!(camera = camera_id, "Camera disabled, restart refused");
            return Err(CamError::CameraDisabled {
                id: camera_id.to_string(),
            });
        }
        self.queue_tx
            .send(camera)
            .map_err(|_| CamError::Encoder("streaming queue closed".into()))?;
        Ok(())
    }

    /// Reload the camera list and restart every enabled camera's stream.
    /// Returns (restarted, failed).
    pub async fn restart_all(&self) -> Result<(usize, usize)> {
        let cameras = self.registry.reload()?;
        let mut restarted = 0;
        let mut failed = 0;
        for camera in cameras.iter().filter(|c| c.enabled) {
            match self.restart_stream(&camera.id).await {
                Ok(()) => restarted += 1,
                Err(e) => {
                    warn!(camera = camera.id, error = %e, "Restart failed");
                    failed += 1;
                }
            }
        }
        Ok((restarted, failed))
    }

    /// Stop one camera's stream and drop its session.
    pub async fn stop_stream(&self, camera_id: &str) -> Result<()> {
        let session = {
            let mut tables = self.tables.lock();
            let session = tables.sessions.remove(camera_id);
            if session.is_some() {
                tables.active = tables.active.saturating_sub(1);
            }
            session
        }
        .ok_or_else(|| CamError::NoActiveSession {
            id: camera_id.to_string(),
        })?;

        {
            let mut child = session.child.lock().await;
            let _ = self.encoder.terminate(&mut child, TERMINATE_BUDGET).await;
        }
        self.encoder.kill_all(Some(camera_id));
        fsutil::prune_segments(
            &self.settings.camera_tmp_dir(camera_id),
            &self.settings.playlist_path(camera_id),
            self.settings.hls_segment_max_age,
            false,
        );
        info!(camera = camera_id, "Stream stopped");
        Ok(())
    }

    /// Tear everything down: terminate each session, clear every table, then
    /// sweep the host for leftovers. Active count is forced to zero.
    pub async fn stop_all(&self) {
        info!("Stopping all streaming sessions");
        let sessions: Vec<(String, Arc<tokio::sync::Mutex<Child>>)> = {
            let mut tables = self.tables.lock();
            tables
                .sessions
                .drain()
                .map(|(id, session)| (id, session.child))
                .collect()
        };
        for (camera_id, child) in sessions {
            let mut guard = child.lock().await;
            if !self.encoder.terminate(&mut guard, TERMINATE_BUDGET).await {
                error!(camera = camera_id, "Stream child survived termination");
            }
        }
        {
            let mut tables = self.tables.lock();
            tables.sessions.clear();
            tables.restarts.clear();
            tables.launching.clear();
            tables.active = 0;
        }
        self.encoder.kill_all(None);
        info!("All streaming sessions stopped");
    }

    /// Bring the session table in line with a freshly reloaded camera list:
    /// sessions for removed or disabled cameras stop, sessions whose RTSP URL
    /// changed restart, enabled cameras without a session are queued.
    pub async fn reconcile(&self) -> Result<()> {
        let cameras = self.registry.reload()?;
        let by_id: HashMap<&str, &Camera> =
            cameras.iter().map(|c| (c.id.as_str(), c)).collect();

        let mut to_stop = Vec::new();
        let mut to_restart = Vec::new();
        {
            let tables = self.tables.lock();
            for (id, session) in &tables.sessions {
                match by_id.get(id.as_str()) {
                    None => to_stop.push(id.clone()),
                    Some(camera) if !camera.enabled => to_stop.push(id.clone()),
                    Some(camera) if camera.rtsp_url != session.rtsp_url => {
                        to_restart.push(id.clone())
                    }
                    Some(_) => {}
                }
            }
        }

        for camera_id in to_stop {
            info!(camera = camera_id, "Camera removed or disabled, stopping stream");
            let _ = self.stop_stream(&camera_id).await;
        }
        for camera_id in to_restart {
            info!(camera = camera_id, "RTSP URL changed, restarting stream");
            let _ = self.restart_stream(&camera_id).await;
        }
        for camera in cameras.iter().filter(|c| c.enabled) {
            self.get_or_start(camera);
        }
        Ok(())
    }

    // ──────────────── worker pool ─────────────────────────────────────────

    async fn worker(self: Arc<Self>, worker_id: usize) {
        debug!(worker = worker_id, "Streaming worker started");
        loop {
            let Some(queued) = self.next_queued().await else {
                continue;
            };
            if self.session_or_launch_pending(&queued.id) {
                continue;
            }
            // The camera may have been disabled, removed, or re-pointed while
            // it sat in the queue; always launch from the fresh descriptor.
            let camera = match self.registry.get(&queued.id) {
                Ok(fresh) if fresh.enabled => fresh,
                Ok(_) => {
                    info!(camera = queued.id, "Camera disabled while queued, dropping");
                    continue;
                }
                Err(_) => {
                    info!(camera = queued.id, "Camera no longer configured, dropping");
                    continue;
                }
            };

            let active = self.active_count();
            if active >= self.settings.max_concurrent_streams {
                warn!(
                    camera = camera.id,
                    active,
                    limit = self.settings.max_concurrent_streams,
                    "Concurrent stream limit reached, deferring"
                );
                self.requeue(camera);
                sleep(Duration::from_secs(5)).await;
                continue;
            }

            let sample = self.resources.latest();
            if sample.cpu_percent > self.settings.max_cpu_percent
                || sample.memory_percent > self.settings.max_mem_percent
            {
                warn!(
                    camera = camera.id,
                    cpu = sample.cpu_percent,
                    memory = sample.memory_percent,
                    "Resource pressure, deferring stream"
                );
                self.requeue(camera);
                sleep(Duration::from_secs(10)).await;
                continue;
            }

            if !self.begin_launch(&camera.id) {
                continue;
            }
            // Short settle so back-to-back launches don't stampede the host.
            sleep(Duration::from_secs(1)).await;

            let result = self.clone().launch_stream(&camera).await;
            self.end_launch(&camera.id);
            if let Err(e) = result {
                error!(camera = camera.id, error = %e, "Stream launch failed");
                sleep(Duration::from_secs(10)).await;
                self.requeue(camera);
            }
        }
    }

    fn begin_launch(&self, camera_id: &str) -> bool {
        let mut tables = self.tables.lock();
        !tables.sessions.contains_key(camera_id) && tables.launching.insert(camera_id.to_string())
    }

    fn end_launch(&self, camera_id: &str) {
        self.tables.lock().launching.remove(camera_id);
    }

    /// Dequeue with a 1 s poll so workers regularly reach their check point.
    async fn next_queued(&self) -> Option<Camera> {
        let mut rx = self.queue_rx.lock().await;
        match timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(camera)) => Some(camera),
            _ => None,
        }
    }

    fn requeue(&self, camera: Camera) {
        let _ = self.queue_tx.send(camera);
    }

    // ──────────────── launch ──────────────────────────────────────────────

    async fn launch_stream(self: Arc<Self>, camera: &Camera) -> Result<()> {
        let camera_id = &camera.id;
        let tmp_dir = self.settings.camera_tmp_dir(camera_id);
        fsutil::ensure_directory(&tmp_dir)?;
        fsutil::ensure_directory(&self.settings.log_path)?;

        info!(
            camera = camera_id,
            url = redact_credentials(&camera.rtsp_url),
            "Launching stream"
        );

        // A leftover encoder or stale artifacts would mix old segments into
        // the new session.
        self.encoder.kill_all(Some(camera_id));
        clear_session_artifacts(&tmp_dir);
        sleep(Duration::from_millis(500)).await;

        let playlist_path = self.settings.playlist_path(camera_id);
        let log_path = self.settings.log_path.join(format!(
            "hls_{camera_id}_{}.log",
            Local::now().format("%Y%m%d%H%M%S")
        ));
        let args = self.encoder.hls_command(&camera.rtsp_url, &playlist_path);
        let mut child = self.encoder.start(&args, Some(&log_path), true)?;

        // Wait for a playable playlist: header plus at least one segment.
        let deadline = Instant::now() + PLAYLIST_WAIT;
        let mut ready = false;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                let log_tail = read_log_tail(&log_path, 2048);
                error!(
                    camera = camera_id,
                    status = %status,
                    log = log_tail,
                    "Encoder exited while waiting for playlist"
                );
                self.diagnose_rtsp(camera).await;
                return Err(CamError::Encoder(format!(
                    "encoder exited with {status} before producing a playlist"
                )));
            }
            if playlist_ready(&playlist_path) && has_segment(&tmp_dir) {
                ready = true;
                break;
            }
            sleep(Duration::from_millis(250)).await;
        }
        if !ready {
            warn!(camera = camera_id, "No playlist within the startup window");
            let _ = self.encoder.terminate(&mut child, TERMINATE_BUDGET).await;
            self.diagnose_rtsp(camera).await;
            return Err(CamError::Encoder(format!(
                "no playlist for camera {camera_id} within {}s",
                PLAYLIST_WAIT.as_secs()
            )));
        }

        let token = self.session_seq.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let child = Arc::new(tokio::sync::Mutex::new(child));
        let replaced = {
            let mut tables = self.tables.lock();
            let previous = tables.sessions.insert(
                camera_id.clone(),
                StreamSession {
                    token,
                    pid,
                    child: child.clone(),
                    rtsp_url: camera.rtsp_url.clone(),
                    started_at: Instant::now(),
                    playlist_size: 0,
                    last_segment_mtime: None,
                },
            );
            if previous.is_none() {
                tables.active += 1;
            }
            tables.restarts.entry(camera_id.clone()).or_default().count = 0;
            previous.map(|s| s.child)
        };
        if let Some(old_child) = replaced {
            // Two workers raced the same camera; the table keeps the newer one.
            warn!(camera = camera_id, "Replacing concurrent session");
            let mut guard = old_child.lock().await;
            let _ = self.encoder.terminate(&mut guard, TERMINATE_BUDGET).await;
        }

        info!(
            camera = camera_id,
            pid,
            active = self.active_count(),
            "Streaming session started"
        );

        let this = self.clone();
        let id = camera_id.clone();
        let monitored_child = child.clone();
        tokio::spawn(async move { this.monitor_process(id, token, monitored_child).await });

        let this = self.clone();
        let id = camera_id.clone();
        tokio::spawn(async move { this.monitor_hls(id, token).await });

        Ok(())
    }

    async fn diagnose_rtsp(&self, camera: &Camera) {
        match self
            .encoder
            .probe_rtsp(&camera.rtsp_url, self.settings.rtsp_timeout)
            .await
        {
            Ok(()) => info!(
                camera = camera.id,
                "RTSP source reachable; encoder-side startup problem"
            ),
            Err(reason) => error!(
                camera = camera.id,
                url = redact_credentials(&camera.rtsp_url),
                reason,
                "RTSP source unreachable"
            ),
        }
    }

    // ──────────────── monitors ────────────────────────────────────────────

    /// Child liveness: an exited encoder gets its session cleaned up and the
    /// camera re-queued after the cooldown.
    async fn monitor_process(
        self: Arc<Self>,
        camera_id: String,
        token: u64,
        child: Arc<tokio::sync::Mutex<Child>>,
    ) {
        debug!(camera = camera_id, "Process monitor started");
        loop {
            sleep(self.settings.streaming_check_interval).await;
            if !self.session_matches(&camera_id, token) {
                debug!(camera = camera_id, "Session replaced, process monitor exiting");
                return;
            }
            let exited = {
                let mut guard = child.lock().await;
                matches!(guard.try_wait(), Ok(Some(_)))
            };
            if exited {
                warn!(camera = camera_id, "Streaming encoder exited");
                if self.cleanup_session(&camera_id, token) {
                    self.encoder.kill_all(Some(&camera_id));
                    fsutil::prune_segments(
                        &self.settings.camera_tmp_dir(&camera_id),
                        &self.settings.playlist_path(&camera_id),
                        self.settings.hls_segment_max_age,
                        false,
                    );
                }
                sleep(self.settings.restart_cooldown).await;
                if let Err(e) = self.restart_stream(&camera_id).await {
                    warn!(camera = camera_id, error = %e, "Restart after encoder exit failed");
                }
                return;
            }
        }
    }

    /// Playlist freshness: a playlist that stops updating for longer than the
    /// update budget forces an immediate restart.
    async fn monitor_hls(self: Arc<Self>, camera_id: String, token: u64) {
        debug!(camera = camera_id, "Playlist monitor started");
        let mut last_healthy = Instant::now();
        loop {
            sleep(self.settings.streaming_check_interval).await;
            if !self.session_matches(&camera_id, token) {
                debug!(camera = camera_id, "Session replaced, playlist monitor exiting");
                return;
            }
            if self.playlist_healthy(&camera_id) {
                last_healthy = Instant::now();
            } else if last_healthy.elapsed() > self.settings.hls_update_timeout {
                warn!(
                    camera = camera_id,
                    stalled_secs = last_healthy.elapsed().as_secs(),
                    "Playlist stalled, restarting stream"
                );
                if let Err(e) = self.restart_stream(&camera_id).await {
                    warn!(camera = camera_id, error = %e, "Restart after stall failed");
                }
                return;
            }
        }
    }

    /// Playlist exists, has real content referencing segments, and the newest
    /// segment on disk is fresh. Updates the session's observed marks.
    fn playlist_healthy(&self, camera_id: &str) -> bool {
        let playlist_path = self.settings.playlist_path(camera_id);
        let tmp_dir = self.settings.camera_tmp_dir(camera_id);

        let Ok(meta) = std::fs::metadata(&playlist_path) else {
            return false;
        };
        if meta.len() < 100 {
            return false;
        }
        let Ok(content) = std::fs::read_to_string(&playlist_path) else {
            return false;
        };
        if !content.contains(".ts") {
            return false;
        }
        let Some(newest) = newest_segment_mtime(&tmp_dir) else {
            return false;
        };
        let fresh = SystemTime::now()
            .duration_since(newest)
            .map(|age| age <= self.settings.hls_update_timeout)
            .unwrap_or(true);
        if fresh {
            let mut tables = self.tables.lock();
            if let Some(session) = tables.sessions.get_mut(camera_id) {
                session.playlist_size = meta.len();
                session.last_segment_mtime = Some(newest);
            }
        }
        fresh
    }

    /// Periodic sweep over all sessions: reap zombies, catch long-missing or
    /// long-stale playlists, and queue enabled cameras that have no session.
    async fn global_health_monitor(self: Arc<Self>) {
        info!("Global stream health monitor started");
        let mut missing_since: HashMap<String, Instant> = HashMap::new();

        loop {
            sleep(self.settings.health_check_interval).await;
            let stale_budget = self.settings.hls_update_timeout * 2;

            let snapshot: Vec<(String, u64, Arc<tokio::sync::Mutex<Child>>)> = {
                let tables = self.tables.lock();
                tables
                    .sessions
                    .iter()
                    .map(|(id, s)| (id.clone(), s.token, s.child.clone()))
                    .collect()
            };

            for (camera_id, token, child) in snapshot {
                let exited = {
                    let mut guard = child.lock().await;
                    matches!(guard.try_wait(), Ok(Some(_)))
                };
                if exited {
                    warn!(camera = camera_id, "Zombie session found by global sweep");
                    if self.cleanup_session(&camera_id, token) {
                        self.encoder.kill_all(Some(&camera_id));
                    }
                    if let Err(e) = self.restart_stream(&camera_id).await {
                        warn!(camera = camera_id, error = %e, "Zombie restart failed");
                    }
                    continue;
                }

                let playlist_path = self.settings.playlist_path(&camera_id);
                if !playlist_path.exists() {
                    let first_seen = missing_since
                        .entry(camera_id.clone())
                        .or_insert_with(Instant::now);
                    if first_seen.elapsed() > stale_budget {
                        error!(
                            camera = camera_id,
                            missing_secs = first_seen.elapsed().as_secs(),
                            "Playlist missing too long, restarting"
                        );
                        missing_since.remove(&camera_id);
                        if let Err(e) = self.restart_stream(&camera_id).await {
                            warn!(camera = camera_id, error = %e, "Restart failed");
                        }
                    }
                    continue;
                }
                missing_since.remove(&camera_id);

                let age = std::fs::metadata(&playlist_path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|mtime| SystemTime::now().duration_since(mtime).ok());
                if let Some(age) = age {
                    if age > stale_budget {
                        error!(
                            camera = camera_id,
                            stale_secs = age.as_secs(),
                            "Playlist stale beyond budget, restarting"
                        );
                        if let Err(e) = self.restart_stream(&camera_id).await {
                            warn!(camera = camera_id, error = %e, "Restart failed");
                        }
                    }
                }
            }

            // Enabled cameras that lost (or never had) a session get queued.
            if let Ok(cameras) = self.registry.enabled_cameras() {
                let busy: HashSet<String> = {
                    let tables = self.tables.lock();
                    tables
                        .sessions
                        .keys()
                        .chain(tables.launching.iter())
                        .cloned()
                        .collect()
                };
                for camera in cameras {
                    if !busy.contains(&camera.id) {
                        debug!(camera = camera.id, "Enabled camera without session, queueing");
                        self.get_or_start(&camera);
                    }
                }
            }
        }
    }

    // ──────────────── table helpers ───────────────────────────────────────

    fn session_matches(&self, camera_id: &str, token: u64) -> bool {
        self.tables
            .lock()
            .sessions
            .get(camera_id)
            .map(|s| s.token == token)
            .unwrap_or(false)
    }

    /// Remove the session if it still is the one the caller watched.
    fn cleanup_session(&self, camera_id: &str, token: u64) -> bool {
        let mut tables = self.tables.lock();
        let matches = tables
            .sessions
            .get(camera_id)
            .map(|s| s.token == token)
            .unwrap_or(false);
        if matches {
            tables.sessions.remove(camera_id);
            tables.active = tables.active.saturating_sub(1);
        }
        matches
    }
}

/// Playlist exists and carries the HLS header.
fn playlist_ready(playlist_path: &Path) -> bool {
    std::fs::read_to_string(playlist_path)
        .map(|content| content.starts_with("#EXTM3U"))
        .unwrap_or(false)
}

/// At least one segment file exists in the camera's tmp directory.
fn has_segment(tmp_dir: &Path) -> bool {
    std::fs::read_dir(tmp_dir)
        .map(|entries| {
            entries.flatten().any(|entry| {
                entry.path().extension().and_then(|e| e.to_str()) == Some("ts")
            })
        })
        .unwrap_or(false)
}

fn newest_segment_mtime(tmp_dir: &Path) -> Option<SystemTime> {
    let entries = std::fs::read_dir(tmp_dir).ok()?;
    entries
        .flatten()
        .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some("ts"))
        .filter_map(|entry| entry.metadata().ok()?.modified().ok())
        .max()
}

/// Delete the playlist and every segment so a fresh session starts clean.
fn clear_session_artifacts(tmp_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(tmp_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("ts") | Some("m3u8") => {
                let _ = std::fs::remove_file(&path);
            }
            _ => {}
        }
    }
}
