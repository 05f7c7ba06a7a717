//! Runtime settings.
//!
//! Everything is read from environment variables with sensible defaults, so
//! a bare `camwatch run` works against `./cam`. The camera list itself lives
//! in a separate plain-text file (see [`crate::cameras`]); this module only
//! knows its path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CamError, Result};

/// Segments kept in the live playlist window.
pub const HLS_PLAYLIST_SIZE: u32 = 48;

/// Immutable process-wide settings, shared as `Arc<Settings>`.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root under which tmp/record/backup/log live.
    pub base_path: PathBuf,
    /// Camera list file, one camera per line.
    pub config_path: PathBuf,
    /// HLS playlists and segments.
    pub tmp_path: PathBuf,
    /// Finished MP4 recordings.
    pub record_path: PathBuf,
    /// Mirrored recordings.
    pub backup_path: PathBuf,
    /// Per-session encoder logs and diagnostics.
    pub log_path: PathBuf,

    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub ffmpeg_buffer_size: String,
    pub ffmpeg_thread_queue_size: u32,
    /// Prefer the hardware H.264 encoder for recording transcodes.
    pub hwaccel: bool,

    pub hls_segment_duration: u32,
    pub max_recording_minutes: u64,
    pub min_disk_space_gb: u64,

    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,

    pub max_concurrent_streams: usize,
    pub max_cpu_percent: f32,
    pub max_mem_percent: f32,
    pub resource_check_interval: Duration,

    pub cleanup_interval: Duration,
    pub hls_segment_max_age: Duration,
    pub recording_max_age_days: u64,
    pub max_recordings_per_camera: usize,

    pub rtsp_timeout: Duration,
    pub health_check_interval: Duration,
    pub hls_update_timeout: Duration,
    pub streaming_check_interval: Duration,
    pub restart_cooldown: Duration,
    pub max_restart_count: u32,

    pub api_port: u16,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CamError::Config(format!("{key}: cannot parse '{raw}'"))),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}

impl Settings {
    /// Built-in defaults rooted at `base`, untouched by the environment.
    pub fn defaults_at(base: PathBuf) -> Self {
        Settings {
            config_path: base.join("cam_config.txt"),
            tmp_path: base.join("tmp"),
            record_path: base.join("record"),
            backup_path: base.join("backup"),
            log_path: base.join("log"),
            base_path: base,

            ffmpeg_path: "ffmpeg".into(),
            ffprobe_path: "ffprobe".into(),
            ffmpeg_buffer_size: "32768k".into(),
            ffmpeg_thread_queue_size: 512,
            hwaccel: false,

            hls_segment_duration: 1,
            max_recording_minutes: 60,
            min_disk_space_gb: 1,

            retry_attempts: 5,
            retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(5),

            max_concurrent_streams: 10,
            max_cpu_percent: 80.0,
            max_mem_percent: 80.0,
            resource_check_interval: Duration::from_secs(30),

            cleanup_interval: Duration::from_secs(300),
            hls_segment_max_age: Duration::from_secs(180),
            recording_max_age_days: 7,
            max_recordings_per_camera: 100,

            rtsp_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(10),
            hls_update_timeout: Duration::from_secs(10),
            streaming_check_interval: Duration::from_secs(3),
            restart_cooldown: Duration::from_secs(30),
            max_restart_count: 5,

            api_port: 8080,
        }
    }

    /// Read all settings from the environment.
    pub fn from_env() -> Result<Self> {
        let base = PathBuf::from(env_string("BASE_PATH", "./cam"));
        let mut s = Settings::defaults_at(base);

        if let Ok(v) = std::env::var("CONFIG_PATH") {
            s.config_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TMP_PATH") {
            s.tmp_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RECORD_PATH") {
            s.record_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BACKUP_PATH") {
            s.backup_path = PathBuf::from(v);
        }

        s.ffmpeg_path = env_string("FFMPEG_PATH", &s.ffmpeg_path);
        s.ffprobe_path = env_string("FFPROBE_PATH", &s.ffprobe_path);
        s.ffmpeg_buffer_size = env_string("FFMPEG_BUFFER_SIZE", &s.ffmpeg_buffer_size);
        s.ffmpeg_thread_queue_size =
            env_parse("FFMPEG_THREAD_QUEUE_SIZE", s.ffmpeg_thread_queue_size)?;
        s.hwaccel = env_parse::<u8>("FFMPEG_HWACCEL", u8::from(s.hwaccel))? != 0;

        s.hls_segment_duration = env_parse("HLS_SEGMENT_DURATION", s.hls_segment_duration)?;
        s.max_recording_minutes = env_parse("MAX_RECORDING_MINUTES", s.max_recording_minutes)?;
        s.min_disk_space_gb = env_parse("MIN_DISK_SPACE_GB", s.min_disk_space_gb)?;

        s.retry_attempts = env_parse("RETRY_ATTEMPTS", s.retry_attempts)?;
        s.retry_delay = env_secs("RETRY_DELAY", s.retry_delay)?;
        s.max_retry_delay = env_secs("MAX_RETRY_DELAY", s.max_retry_delay)?;

        s.max_concurrent_streams = env_parse("MAX_CONCURRENT_STREAMS", s.max_concurrent_streams)?;
        s.max_cpu_percent = env_parse("MAX_CPU_PERCENT", s.max_cpu_percent)?;
        s.max_mem_percent = env_parse("MAX_MEM_PERCENT", s.max_mem_percent)?;
        s.resource_check_interval =
            env_secs("RESOURCE_CHECK_INTERVAL", s.resource_check_interval)?;

        s.cleanup_interval = env_secs("CLEANUP_INTERVAL", s.cleanup_interval)?;
        s.hls_segment_max_age = env_secs("HLS_SEGMENT_MAX_AGE", s.hls_segment_max_age)?;
        s.recording_max_age_days =
            env_parse("RECORDING_MAX_AGE_DAYS", s.recording_max_age_days)?;
        s.max_recordings_per_camera =
            env_parse("MAX_RECORDINGS_PER_CAMERA", s.max_recordings_per_camera)?;

        s.rtsp_timeout = env_secs("RTSP_TIMEOUT", s.rtsp_timeout)?;
        s.health_check_interval = env_secs("HEALTH_CHECK_INTERVAL", s.health_check_interval)?;
        s.hls_update_timeout = env_secs("HLS_UPDATE_TIMEOUT", s.hls_update_timeout)?;
        s.streaming_check_interval =
            env_secs("STREAMING_CHECK_INTERVAL", s.streaming_check_interval)?;
        s.restart_cooldown = env_secs("RESTART_COOLDOWN", s.restart_cooldown)?;
        s.max_restart_count = env_parse("MAX_RESTART_COUNT", s.max_restart_count)?;

        s.api_port = env_parse("API_PORT", s.api_port)?;

        s.validate()?;
        Ok(s)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_streams == 0 {
            return Err(CamError::Config("MAX_CONCURRENT_STREAMS must be > 0".into()));
        }
        if self.hls_segment_duration == 0 {
            return Err(CamError::Config("HLS_SEGMENT_DURATION must be > 0".into()));
        }
        if self.max_recording_minutes == 0 {
            return Err(CamError::Config("MAX_RECORDING_MINUTES must be > 0".into()));
        }
        if self.retry_attempts == 0 {
            return Err(CamError::Config("RETRY_ATTEMPTS must be > 0".into()));
        }
        Ok(())
    }

    /// Per-camera HLS output directory.
    pub fn camera_tmp_dir(&self, camera_id: &str) -> PathBuf {
        self.tmp_path.join(camera_id)
    }

    /// Per-camera recording directory.
    pub fn camera_record_dir(&self, camera_id: &str) -> PathBuf {
        self.record_path.join(camera_id)
    }

    /// Playlist path for a camera: `<tmp>/<id>/<id>.m3u8`.
    pub fn playlist_path(&self, camera_id: &str) -> PathBuf {
        self.camera_tmp_dir(camera_id)
            .join(format!("{camera_id}.m3u8"))
    }

    /// URL under which our own HTTP surface serves a camera's playlist.
    pub fn local_hls_url(&self, camera_id: &str) -> String {
        format!(
            "http://127.0.0.1:{}/hls/{camera_id}/{camera_id}.m3u8",
            self.api_port
        )
    }

    pub fn max_recording_duration(&self) -> Duration {
        Duration::from_secs(self.max_recording_minutes * 60)
    }
}

/// Verify the encoder binary is runnable. Fatal at startup when it is not.
pub fn check_encoder(ffmpeg_path: &str) -> Result<()> {
    let output = std::process::Command::new(ffmpeg_path)
        .arg("-version")
        .output()
        .map_err(|e| {
            CamError::Config(format!("encoder binary '{ffmpeg_path}' not runnable: {e}"))
        })?;
    if !output.status.success() {
        return Err(CamError::Config(format!(
            "encoder binary '{ffmpeg_path}' exited with {}",
            output.status
        )));
    }
    let first_line = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    tracing::info!(version = first_line, "Encoder detected");
    Ok(())
}

/// Verify the camera list file exists before anything else starts.
pub fn check_config_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(CamError::Config(format!(
            "camera list file not found: {}",
            path.display()
        )));
    }
    Ok(())
}
