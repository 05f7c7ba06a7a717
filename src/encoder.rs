//! Encoder driver.
//!
//! Builds command lines for the external encoder, starts and terminates the
//! child processes, and runs the small probe invocations (RTSP reachability,
//! audio presence, MP4 finalize). The encoder binary is opaque: everything
//! the supervisors know about it flows through this module.
//!
//! Termination follows an escalation ladder:
//!   1. graceful quit token on the child's stdin, wait up to 3 s
//!   2. polite terminate signal, wait up to 3 s
//!   3. forceful kill of the child's process group
//!   4. verify the process is gone; an unreapable child is logged as
//!      critical and appended to the kill-failure alert file

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use sysinfo::{ProcessesToUpdate, System};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::cameras::redact_credentials;
use crate::config::{Settings, HLS_PLAYLIST_SIZE};
use crate::error::{CamError, Result};

/// Where a recording reads its frames from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSource {
    /// Our own HLS relay for the camera; copied without re-encoding.
    LocalHls { url: String },
    /// The camera directly; transcoded.
    Rtsp { url: String },
}

impl RecordSource {
    pub fn url(&self) -> &str {
        match self {
            RecordSource::LocalHls { url } | RecordSource::Rtsp { url } => url,
        }
    }

    pub fn is_local_hls(&self) -> bool {
        matches!(self, RecordSource::LocalHls { .. })
    }
}

pub struct EncoderDriver {
    settings: Arc<Settings>,
    http: reqwest::Client,
}

impl EncoderDriver {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
        }
    }

    // ──────────────── command construction ────────────────────────────────

    /// Argv for the live HLS transcode of one camera.
    ///
    /// TCP transport, wall-clock timestamps, keyframes forced at segment
    /// boundaries, a bounded self-pruning playlist, segments named
    /// `<base>-%05d.ts` next to the playlist.
    pub fn hls_command(&self, input_url: &str, playlist_path: &Path) -> Vec<String> {
        let s = &self.settings;
        let segment_time = s.hls_segment_duration;
        let stem = playlist_path
            .file_stem()
            .map(|v| v.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stream".into());
        let segment_pattern = playlist_path
            .with_file_name(format!("{stem}-%05d.ts"))
            .to_string_lossy()
            .into_owned();

        vec![
            "-rtsp_transport".into(),
            "tcp".into(),
            "-buffer_size".into(),
            s.ffmpeg_buffer_size.clone(),
            "-max_delay".into(),
            "100000".into(),
            "-analyzeduration".into(),
            "1000000".into(),
            "-probesize".into(),
            "1000000".into(),
            "-fflags".into(),
            "+genpts+discardcorrupt+igndts+ignidx+flush_packets".into(),
            "-err_detect".into(),
            "ignore_err".into(),
            "-avoid_negative_ts".into(),
            "make_zero".into(),
            "-use_wallclock_as_timestamps".into(),
            "1".into(),
            "-thread_queue_size".into(),
            s.ffmpeg_thread_queue_size.to_string(),
            "-flags".into(),
            "+global_header".into(),
            "-i".into(),
            input_url.into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-tune".into(),
            "zerolatency".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "128k".into(),
            "-ar".into(),
            "44100".into(),
            "-ac".into(),
            "2".into(),
            "-fps_mode".into(),
            "cfr".into(),
            "-force_key_frames".into(),
            format!("expr:gte(t,n_forced*{segment_time})"),
            "-sc_threshold".into(),
            "0".into(),
            "-g".into(),
            (segment_time * 30).to_string(),
            "-hls_time".into(),
            segment_time.to_string(),
            "-hls_list_size".into(),
            HLS_PLAYLIST_SIZE.to_string(),
            "-hls_flags".into(),
            "delete_segments+independent_segments+split_by_time".into(),
            "-hls_segment_type".into(),
            "mpegts".into(),
            "-hls_segment_filename".into(),
            segment_pattern,
            "-hls_start_number_source".into(),
            "datetime".into(),
            "-hls_allow_cache".into(),
            "0".into(),
            "-start_number".into(),
            "1".into(),
            "-max_muxing_queue_size".into(),
            "4096".into(),
            "-f".into(),
            "hls".into(),
            "-y".into(),
            playlist_path.to_string_lossy().into_owned(),
        ]
    }

    /// Argv for a recording. The local HLS relay is copied; a direct RTSP
    /// source is transcoded, on the hardware encoder when configured.
    pub fn record_command(&self, source: &RecordSource, output_path: &Path) -> Vec<String> {
        let s = &self.settings;
        let mut args: Vec<String> = Vec::new();

        match source {
            RecordSource::LocalHls { url } => {
                args.extend([
                    "-protocol_whitelist".into(),
                    "file,http,https,tcp,tls".into(),
                    "-i".into(),
                    url.clone(),
                    "-c:v".into(),
                    "copy".into(),
                    "-c:a".into(),
                    "copy".into(),
                ]);
            }
            RecordSource::Rtsp { url } => {
                args.extend([
                    "-rtsp_transport".into(),
                    "tcp".into(),
                    "-buffer_size".into(),
                    s.ffmpeg_buffer_size.clone(),
                    "-use_wallclock_as_timestamps".into(),
                    "1".into(),
                    "-thread_queue_size".into(),
                    s.ffmpeg_thread_queue_size.to_string(),
                ]);
                if s.hwaccel {
                    args.extend(["-hwaccel".into(), "cuda".into()]);
                }
                args.extend(["-i".into(), url.clone()]);
                args.extend(["-c:v".into(), self.video_encoder().into()]);
                args.extend(["-preset".into(), "fast".into(), "-r".into(), "30".into()]);
                args.extend([
                    "-c:a".into(),
                    "aac".into(),
                    "-b:a".into(),
                    "128k".into(),
                    "-ar".into(),
                    "44100".into(),
                    "-ac".into(),
                    "2".into(),
                ]);
            }
        }

        args.extend([
            "-max_muxing_queue_size".into(),
            "2048".into(),
            "-fflags".into(),
            "+genpts+discardcorrupt+igndts".into(),
            "-avoid_negative_ts".into(),
            "make_zero".into(),
            "-start_at_zero".into(),
            "-fps_mode".into(),
            "cfr".into(),
            "-movflags".into(),
            "+faststart+frag_keyframe".into(),
            "-y".into(),
            output_path.to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Argv for the replacement child started at a rotation boundary.
    /// Rotations always read RTSP directly and pad frame sizes to even
    /// dimensions for the encoder.
    pub fn rotation_command(
        &self,
        rtsp_url: &str,
        output_path: &Path,
        has_audio: bool,
    ) -> Vec<String> {
        let s = &self.settings;
        let mut args: Vec<String> = vec![
            "-rtsp_transport".into(),
            "tcp".into(),
            "-buffer_size".into(),
            s.ffmpeg_buffer_size.clone(),
            "-use_wallclock_as_timestamps".into(),
            "1".into(),
            "-i".into(),
            rtsp_url.into(),
            "-r".into(),
            "30".into(),
            "-vf".into(),
            "scale=trunc(iw/2)*2:trunc(ih/2)*2,format=yuv420p".into(),
            "-c:v".into(),
            self.video_encoder().into(),
            "-preset".into(),
            "fast".into(),
            "-b:v".into(),
            "4M".into(),
        ];
        if has_audio {
            args.extend([
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                "128k".into(),
                "-ar".into(),
                "44100".into(),
                "-ac".into(),
                "2".into(),
            ]);
        } else {
            args.push("-an".into());
        }
        args.extend([
            "-max_muxing_queue_size".into(),
            "2048".into(),
            "-fflags".into(),
            "+genpts+discardcorrupt+igndts".into(),
            "-avoid_negative_ts".into(),
            "make_zero".into(),
            "-start_at_zero".into(),
            "-fps_mode".into(),
            "cfr".into(),
            "-movflags".into(),
            "+faststart+frag_keyframe".into(),
            "-y".into(),
            output_path.to_string_lossy().into_owned(),
        ]);
        args
    }

    fn video_encoder(&self) -> &'static str {
        if self.settings.hwaccel {
            "h264_nvenc"
        } else {
            "libx264"
        }
    }

    // ──────────────── process lifecycle ───────────────────────────────────

    /// Start an encoder child.
    ///
    /// With `log_path`, stdout and stderr stream into that file (the file is
    /// headed with the launch time and redacted command). Otherwise stderr is
    /// piped for a caller-owned monitor. Stdin is always piped so the quit
    /// token can be delivered later.
    pub fn start(
        &self,
        args: &[String],
        log_path: Option<&Path>,
        high_priority: bool,
    ) -> Result<Child> {
        let redacted: Vec<String> = args.iter().map(|a| redact_credentials(a)).collect();
        debug!(command = redacted.join(" "), "Starting encoder");

        let mut command = Command::new(&self.settings.ffmpeg_path);
        command.args(args).stdin(Stdio::piped()).kill_on_drop(true);

        match log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut log_file = std::fs::File::create(path)?;
                use std::io::Write;
                writeln!(
                    log_file,
                    "Encoder log started at {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S")
                )?;
                writeln!(log_file, "Command: {}", redacted.join(" "))?;
                let stderr_file = log_file.try_clone()?;
                command
                    .stdout(Stdio::from(log_file))
                    .stderr(Stdio::from(stderr_file));
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::piped());
            }
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(move || {
                // Own process group so the whole encoder tree can be killed.
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                if high_priority {
                    // Best effort; silently keeps the default without privileges.
                    let _ = unsafe { nix::libc::setpriority(nix::libc::PRIO_PROCESS, 0, -5) };
                }
                Ok(())
            });
        }
        #[cfg(not(unix))]
        let _ = high_priority;

        let child = command
            .spawn()
            .map_err(|e| CamError::Encoder(format!("spawn failed: {e}")))?;
        info!(pid = child.id(), "Encoder process started");
        Ok(child)
    }

    /// Terminate a child through the escalation ladder. Returns `true` when
    /// the process is confirmed gone.
    pub async fn terminate(&self, child: &mut Child, grace: Duration) -> bool {
        if let Ok(Some(_)) = child.try_wait() {
            return true;
        }
        let pid = child.id();
        info!(pid, "Terminating encoder process");

        // 1. Quit token; closing stdin doubles as an end-of-input signal.
        if let Some(mut stdin) = child.stdin.take() {
            if stdin.write_all(b"q\n").await.is_ok() {
                let _ = stdin.flush().await;
            }
        }
        if timeout(Duration::from_secs(3), child.wait()).await.is_ok() {
            info!(pid, "Encoder exited after quit token");
            return true;
        }

        // 2. Polite terminate.
        #[cfg(unix)]
        if let Some(pid) = pid {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
        if timeout(Duration::from_secs(3), child.wait()).await.is_ok() {
            info!(pid, "Encoder exited after terminate signal");
            return true;
        }

        // 3. Forceful kill of the whole process group.
        warn!(pid, "Encoder ignored terminate signal, killing process tree");
        #[cfg(unix)]
        if let Some(pid) = pid {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(-(pid as i32)),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        let _ = child.kill().await;
        if timeout(grace, child.wait()).await.is_ok() {
            return true;
        }

        // 4. Post-mortem verification.
        if let Some(pid) = pid {
            if pid_exists(pid) {
                error!(pid, "Encoder process survived the full termination ladder");
                self.append_kill_failure(pid);
                return false;
            }
        }
        true
    }

    fn append_kill_failure(&self, pid: u32) {
        use std::io::Write;
        let path = self.settings.log_path.join("process_kill_failure.log");
        let _ = std::fs::create_dir_all(&self.settings.log_path);
        if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            let _ = writeln!(file, "{}: failed to kill encoder pid {pid}", Local::now());
        }
    }

    /// Kill every encoder process on the host, optionally only those whose
    /// command line mentions `camera_id`. Returns the number killed.
    pub fn kill_all(&self, camera_id: Option<&str>) -> usize {
        let needle = Path::new(&self.settings.ffmpeg_path)
            .file_stem()
            .map(|v| v.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ffmpeg".into());

        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut killed = 0;
        for (pid, process) in sys.processes() {
            if !process.name().to_string_lossy().contains(&needle) {
                continue;
            }
            if let Some(id) = camera_id {
                let cmdline = process
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ");
                if !cmdline.contains(id) {
                    continue;
                }
            }
            if process.kill() {
                info!(pid = pid.as_u32(), camera = camera_id, "Killed stray encoder process");
                killed += 1;
            }
        }
        killed
    }

    /// True when any encoder process is still running on the host.
    pub fn any_encoder_alive(&self) -> bool {
        let needle = Path::new(&self.settings.ffmpeg_path)
            .file_stem()
            .map(|v| v.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ffmpeg".into());
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys.processes()
            .values()
            .any(|p| p.name().to_string_lossy().contains(&needle))
    }

    // ──────────────── probes ──────────────────────────────────────────────

    /// Check that the RTSP source answers by capturing one second to the null
    /// muxer. `Err` carries the tail of the encoder's diagnostics.
    pub async fn probe_rtsp(
        &self,
        rtsp_url: &str,
        probe_timeout: Duration,
    ) -> std::result::Result<(), String> {
        debug!(url = redact_credentials(rtsp_url), "RTSP connection check");
        let mut child = Command::new(&self.settings.ffmpeg_path)
            .args(["-rtsp_transport", "tcp", "-i"])
            .arg(rtsp_url)
            .args(["-t", "1", "-f", "null", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("cannot spawn encoder: {e}"))?;

        let stderr = child.stderr.take();
        let wait_with_output = async {
            let mut diagnostics = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut diagnostics).await;
            }
            (child.wait().await, diagnostics)
        };

        match timeout(probe_timeout + Duration::from_secs(2), wait_with_output).await {
            Ok((Ok(status), _)) if status.success() => Ok(()),
            Ok((Ok(status), diagnostics)) => Err(format!(
                "encoder exited with {status}: {}",
                tail_lines(&diagnostics, 4)
            )),
            Ok((Err(e), _)) => Err(format!("wait failed: {e}")),
            Err(_) => Err(format!(
                "probe timed out after {}s",
                probe_timeout.as_secs() + 2
            )),
        }
    }

    /// Whether the RTSP source carries an audio stream. Absence-tolerant:
    /// every failure mode reports `false`.
    pub async fn probe_audio(&self, rtsp_url: &str, probe_timeout: Duration) -> bool {
        let micros = (probe_timeout.as_secs() * 1_000_000).to_string();
        let probe = Command::new(&self.settings.ffprobe_path)
            .args([
                "-v",
                "error",
                "-rtsp_transport",
                "tcp",
                "-timeout",
                &micros,
                "-select_streams",
                "a:0",
                "-show_entries",
                "stream=codec_type",
                "-of",
                "json",
                "-i",
            ])
            .arg(rtsp_url)
            .stdin(Stdio::null())
            .output();

        let output = match timeout(probe_timeout + Duration::from_secs(2), probe).await {
            Ok(Ok(output)) if output.status.success() => output,
            _ => return false,
        };
        let parsed: serde_json::Value = match serde_json::from_slice(&output.stdout) {
            Ok(value) => value,
            Err(_) => return false,
        };
        let has_audio = parsed
            .get("streams")
            .and_then(|streams| streams.as_array())
            .map(|streams| !streams.is_empty())
            .unwrap_or(false);
        if !has_audio {
            debug!(url = redact_credentials(rtsp_url), "No audio stream detected");
        }
        has_audio
    }

    /// HEAD probe against our own HLS relay for the camera, bounded to 2 s so
    /// a stalled relay cannot delay a recording launch.
    pub async fn local_hls_available(&self, camera_id: &str) -> bool {
        let url = self.settings.local_hls_url(camera_id);
        match self
            .http
            .head(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Pick the recording source for a camera: the local HLS relay when it
    /// answers, the camera's RTSP URL otherwise.
    pub async fn choose_record_source(&self, camera_id: &str, rtsp_url: &str) -> RecordSource {
        if self.local_hls_available(camera_id).await {
            info!(camera = camera_id, "Recording from local HLS relay");
            RecordSource::LocalHls {
                url: self.settings.local_hls_url(camera_id),
            }
        } else {
            info!(
                camera = camera_id,
                url = redact_credentials(rtsp_url),
                "Recording directly from RTSP"
            );
            RecordSource::Rtsp {
                url: rtsp_url.to_string(),
            }
        }
    }

    // ──────────────── finalize ────────────────────────────────────────────

    /// Remux a finished recording copy-only with `+faststart` and atomically
    /// replace the original. Empty or missing inputs are a no-op.
    pub async fn finalize_mp4(&self, path: &Path) -> Result<()> {
        let size = match std::fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => {
                warn!(path = %path.display(), "Nothing to finalize");
                return Ok(());
            }
        };

        let temp_path = path.with_extension("temp.mp4");
        let output = Command::new(&self.settings.ffmpeg_path)
            .args(["-i"])
            .arg(path)
            .args([
                "-c:v",
                "copy",
                "-c:a",
                "copy",
                "-map_metadata",
                "0",
                "-movflags",
                "+faststart",
                "-ignore_unknown",
                "-y",
            ])
            .arg(&temp_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CamError::Encoder(format!("finalize spawn failed: {e}")))?;

        let produced = std::fs::metadata(&temp_path).map(|m| m.len()).unwrap_or(0);
        if output.status.success() && produced > 0 {
            std::fs::rename(&temp_path, path)?;
            info!(path = %path.display(), bytes = size, "Recording finalized");
            Ok(())
        } else {
            let _ = std::fs::remove_file(&temp_path);
            Err(CamError::Encoder(format!(
                "finalize of {} failed: {}",
                path.display(),
                tail_lines(&String::from_utf8_lossy(&output.stderr), 4)
            )))
        }
    }
}

/// Whether the OS still knows a process with this pid.
pub fn pid_exists(pid: u32) -> bool {
    let target = sysinfo::Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    sys.process(target).is_some()
}

/// Last `count` lines of possibly long encoder output, joined for a log field.
fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join(" | ")
}

/// Read the tail of an encoder log file for post-mortem error reporting.
pub fn read_log_tail(path: &Path, max_bytes: u64) -> String {
    use std::io::{Read, Seek, SeekFrom};
    let Ok(mut file) = std::fs::File::open(path) else {
        return String::from("(no encoder log)");
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len > max_bytes {
        let _ = file.seek(SeekFrom::Start(len - max_bytes));
    }
    let mut buffer = String::new();
    let _ = file.read_to_string(&mut buffer);
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn driver() -> EncoderDriver {
        EncoderDriver::new(Arc::new(Settings::defaults_at(PathBuf::from("/tmp/cam"))))
    }

    #[test]
    fn hls_command_shape() {
        let args = driver().hls_command("rtsp://cam/1", Path::new("/tmp/cam/tmp/cam1/cam1.m3u8"));
        let joined = args.join(" ");
        assert!(joined.starts_with("-rtsp_transport tcp"));
        assert!(joined.contains("-hls_list_size 48"));
        assert!(joined.contains("delete_segments+independent_segments+split_by_time"));
        assert!(joined.contains("-hls_segment_filename /tmp/cam/tmp/cam1/cam1-%05d.ts"));
        assert!(joined.contains("-force_key_frames expr:gte(t,n_forced*1)"));
        assert!(joined.contains("-use_wallclock_as_timestamps 1"));
        assert!(joined.ends_with("/tmp/cam/tmp/cam1/cam1.m3u8"));
    }

    #[test]
    fn record_command_copies_from_hls() {
        let source = RecordSource::LocalHls {
            url: "http://127.0.0.1:8080/hls/cam1/cam1.m3u8".into(),
        };
        let joined = driver()
            .record_command(&source, Path::new("/out/cam1_1.mp4"))
            .join(" ");
        assert!(joined.contains("-c:v copy"));
        assert!(joined.contains("-c:a copy"));
        assert!(joined.contains("+faststart+frag_keyframe"));
        assert!(!joined.contains("libx264"));
    }

    #[test]
    fn record_command_transcodes_from_rtsp() {
        let source = RecordSource::Rtsp {
            url: "rtsp://cam/1".into(),
        };
        let joined = driver()
            .record_command(&source, Path::new("/out/cam1_1.mp4"))
            .join(" ");
        assert!(joined.contains("-rtsp_transport tcp"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-c:a aac"));
    }

    #[test]
    fn rotation_command_drops_audio_when_absent() {
        let d = driver();
        let with_audio = d
            .rotation_command("rtsp://cam/1", Path::new("/out/a.mp4"), true)
            .join(" ");
        let without_audio = d
            .rotation_command("rtsp://cam/1", Path::new("/out/a.mp4"), false)
            .join(" ");
        assert!(with_audio.contains("-c:a aac"));
        assert!(without_audio.contains("-an"));
        assert!(!without_audio.contains("-c:a aac"));
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc\nd", 2), "c | d");
        assert_eq!(tail_lines("", 2), "");
    }
}
