//! Filesystem custodian: directory preparation, disk-space queries, and the
//! age/count/size-based grooming shared by the cleanup scheduler and the
//! recording supervisor.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sysinfo::Disks;
use tracing::{debug, info, warn};

use crate::error::{CamError, Result};

/// Create a directory if missing and verify it is writable.
pub fn ensure_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .map_err(|e| CamError::Config(format!("cannot create {}: {e}", path.display())))?;
        info!(path = %path.display(), "Created directory");
    } else if !path.is_dir() {
        return Err(CamError::Config(format!(
            "path exists but is not a directory: {}",
            path.display()
        )));
    }

    // Write test: a directory we cannot write to is as bad as a missing one.
    let probe = path.join(".write_test.tmp");
    std::fs::write(&probe, b"probe")
        .map_err(|e| CamError::Config(format!("{} is not writable: {e}", path.display())))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Free bytes on the volume holding `path`. Resolves to the mount point with
/// the longest matching prefix; 0 when nothing matches.
pub fn free_space(path: &Path) -> u64 {
    let resolved = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| resolved.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
        .unwrap_or(0)
}

pub fn free_space_gb(path: &Path) -> f64 {
    free_space(path) as f64 / (1024.0 * 1024.0 * 1024.0)
}

/// True when the volume under `path` has at least `min_free_gb` free.
pub fn has_free_space(path: &Path, min_free_gb: u64) -> bool {
    let free = free_space_gb(path);
    if free < min_free_gb as f64 {
        warn!(path = %path.display(), free_gb = free, required_gb = min_free_gb, "Low disk space");
        return false;
    }
    true
}

/// Total size of all files under `path`, recursively.
pub fn directory_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0u64;
    for entry in entries.flatten() {
        let entry_path = entry.path();
        if entry_path.is_dir() {
            total += directory_size(&entry_path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Delete files in `dir` matching `extension`, first by age, then trimming to
/// `max_files` oldest-first. Files under 1 KiB are treated as corrupt and
/// removed outright. Returns the number of deleted files.
pub fn cleanup_directory(
    dir: &Path,
    extension: &str,
    max_age: Option<Duration>,
    max_files: Option<usize>,
) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let now = SystemTime::now();

    let mut files: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
    let mut deleted = 0usize;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.len() < 1024 {
            if std::fs::remove_file(&path).is_ok() {
                info!(path = %path.display(), size = meta.len(), "Removed undersized file");
                deleted += 1;
            }
            continue;
        }
        let mtime = meta.modified().unwrap_or(now);
        files.push((path, mtime, meta.len()));
    }

    let mut keep: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
    for (path, mtime, size) in files {
        let expired = max_age
            .and_then(|limit| now.duration_since(mtime).ok().map(|age| age > limit))
            .unwrap_or(false);
        if expired {
            if std::fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "Removed expired file");
                deleted += 1;
            }
        } else {
            keep.push((path, mtime, size));
        }
    }

    if let Some(cap) = max_files {
        if keep.len() > cap {
            keep.sort_by_key(|(_, mtime, _)| *mtime);
            for (path, _, _) in keep.drain(..keep.len() - cap) {
                if std::fs::remove_file(&path).is_ok() {
                    debug!(path = %path.display(), "Removed file over retention cap");
                    deleted += 1;
                }
            }
        }
    }

    deleted
}

/// Prune incomplete and duplicate recordings under `base/<camera_id>/`.
///
/// Files below `min_size` are dropped. Files whose mtimes fall within 10 s of
/// each other are duplicates of one rotation boundary; only the largest is
/// kept. Returns deleted count.
pub fn clean_small_recordings(base: &Path, min_size: u64) -> usize {
    let Ok(camera_dirs) = std::fs::read_dir(base) else {
        return 0;
    };
    let mut deleted = 0usize;

    for camera_dir in camera_dirs.flatten() {
        let dir_path = camera_dir.path();
        if !dir_path.is_dir() {
            continue;
        }

        let mut files: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&dir_path) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("mp4") || !path.is_file() {
                    continue;
                }
                if let Ok(meta) = entry.metadata() {
                    files.push((path, meta.modified().unwrap_or(SystemTime::now()), meta.len()));
                }
            }
        }
        files.sort_by_key(|(_, mtime, _)| *mtime);

        // Group neighbors recorded within 10 s of each other and keep only
        // the largest of each group.
        let mut index = 0;
        while index < files.len() {
            let mut group_end = index + 1;
            while group_end < files.len() {
                let gap = files[group_end]
                    .1
                    .duration_since(files[group_end - 1].1)
                    .unwrap_or_default();
                if gap >= Duration::from_secs(10) {
                    break;
                }
                group_end += 1;
            }
            if group_end - index > 1 {
                let largest = files[index..group_end]
                    .iter()
                    .map(|(_, _, size)| *size)
                    .max()
                    .unwrap_or(0);
                let mut kept_one = false;
                for (path, _, size) in &files[index..group_end] {
                    if *size == largest && !kept_one {
                        kept_one = true;
                        continue;
                    }
                    if std::fs::remove_file(path).is_ok() {
                        info!(path = %path.display(), size, "Removed duplicate recording");
                        deleted += 1;
                    }
                }
            }
            index = group_end;
        }

        // Remaining undersized files are incomplete recordings.
        for (path, _, size) in &files {
            if *size < min_size && path.exists() && std::fs::remove_file(path).is_ok() {
                info!(path = %path.display(), size, "Removed incomplete recording");
                deleted += 1;
            }
        }
    }

    if deleted > 0 {
        info!(base = %base.display(), deleted, "Recording pruning finished");
    }
    deleted
}

/// Delete segments in a camera's tmp directory that the current playlist no
/// longer references and that are older than `max_age`. Without a playlist,
/// orphaned segments are removed only when `force` is set.
pub fn prune_segments(camera_dir: &Path, playlist: &Path, max_age: Duration, force: bool) -> usize {
    let Ok(entries) = std::fs::read_dir(camera_dir) else {
        return 0;
    };
    let ts_files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("ts"))
        .collect();
    if ts_files.is_empty() {
        return 0;
    }

    if !playlist.exists() {
        if !force {
            warn!(
                dir = %camera_dir.display(),
                orphans = ts_files.len(),
                "Segments present without a playlist"
            );
            return 0;
        }
        let mut deleted = 0;
        for path in &ts_files {
            if std::fs::remove_file(path).is_ok() {
                deleted += 1;
            }
        }
        return deleted;
    }

    let referenced: std::collections::HashSet<String> = match std::fs::read_to_string(playlist) {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|line| line.ends_with(".ts"))
            .filter_map(|line| {
                Path::new(line)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .collect(),
        // An unreadable playlist means no safe deletions this round.
        Err(_) => return 0,
    };

    let now = SystemTime::now();
    let mut deleted = 0;
    for path in &ts_files {
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        if referenced.contains(&name) {
            continue;
        }
        let old_enough = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if old_enough && std::fs::remove_file(path).is_ok() {
            deleted += 1;
        }
    }
    if deleted > 0 {
        debug!(dir = %camera_dir.display(), deleted, "Pruned stale segments");
    }
    deleted
}

/// Cold-boot hygiene: remove every `.m3u8` and `.ts` left under the tmp root
/// by a previous run.
pub fn clear_stream_artifacts(tmp_root: &Path) -> usize {
    let Ok(camera_dirs) = std::fs::read_dir(tmp_root) else {
        return 0;
    };
    let mut deleted = 0;
    for camera_dir in camera_dirs.flatten() {
        let dir_path = camera_dir.path();
        if !dir_path.is_dir() {
            continue;
        }
        if let Ok(entries) = std::fs::read_dir(&dir_path) {
            for entry in entries.flatten() {
                let path = entry.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some("m3u8") | Some("ts") => {
                        if std::fs::remove_file(&path).is_ok() {
                            deleted += 1;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    if deleted > 0 {
        info!(tmp = %tmp_root.display(), deleted, "Cleared stream artifacts from previous run");
    }
    deleted
}
